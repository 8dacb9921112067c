//////////////////////////////////////////////////////////////////
/// scheduler.rs
///
/// Multi-instance host
///
/// Owns the shared dictionary, the output channel and every VM instance.
/// A dispatch cycle runs each instance that has work on its own scoped thread,
/// waits until all of them have gone idle, then drains the output channel.
/// Instance 0 is the only one allowed to compile.
///
use crate::config::Params;
use crate::error::{ForthError, Result};
use crate::internals::files::Persistence;
use crate::internals::tensor::ObjectStore;
use crate::kernel::Dictionary;
use crate::ostream::{OutputChannel, Record};
use crate::runtime::{ForthRuntime, VmStatus};
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

/// The Forth source compiled at boot
pub const CORE: &str = include_str!("forth/core.fs");

/// Count of instances still running in the current cycle
#[derive(Default)]
struct Idle {
    running: Mutex<usize>,
    cv: Condvar,
}

impl Idle {
    fn wait(&self) {
        let mut running = self.running.lock();
        while *running > 0 {
            self.cv.wait(&mut running);
        }
    }
}

/// Marks one instance busy; dropping it, even while unwinding, marks it idle again
struct Busy<'a>(&'a Idle);

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        let mut running = self.0.running.lock();
        *running = running.saturating_sub(1);
        if *running == 0 {
            self.0.cv.notify_all();
        }
    }
}

pub struct Scheduler {
    dict: Arc<RwLock<Dictionary>>,
    out: Arc<OutputChannel>,
    vms: Vec<ForthRuntime>,
    idle: Idle,
}

impl Scheduler {
    /// new builds the dictionary and the instances; nothing is compiled yet
    pub fn new(params: Params, objects: Option<Arc<dyn ObjectStore>>) -> Result<Scheduler> {
        params.validate()?;
        let mut d = Dictionary::new(params.arena_size);
        ForthRuntime::compile_builtins(&mut d);
        let dict = Arc::new(RwLock::new(d));
        let out = Arc::new(OutputChannel::new(params.obuf_size));
        let vms = (0..params.instances)
            .map(|id| {
                let mut vm = ForthRuntime::new(id, Arc::clone(&dict), Arc::clone(&out), &params);
                vm.objects = objects.clone();
                vm
            })
            .collect();
        info!(
            instances = params.instances,
            group = params.group,
            arena = params.arena_size,
            "scheduler created"
        );
        Ok(Scheduler {
            dict,
            out,
            vms,
            idle: Idle::default(),
        })
    }

    /// Hand every instance the persistence collaborator
    pub fn set_persistence(&mut self, persist: Arc<dyn Persistence>) {
        for vm in &mut self.vms {
            vm.persist = Some(Arc::clone(&persist));
        }
    }

    /// boot compiles the core word set (unless skipped) and fences it against FORGET
    pub fn boot(&mut self, core: bool) -> Result<()> {
        if core {
            self.load_source(CORE)?;
            info!(words = self.dict.read().words().len(), "core loaded");
        }
        self.dict.write().set_fence();
        Ok(())
    }

    /// Compile source text on instance 0, a line at a time
    pub fn load_source(&mut self, text: &str) -> Result<()> {
        for line in text.lines() {
            self.feed(0, line)?;
        }
        Ok(())
    }

    pub fn load_file(&mut self, path: &str) -> Result<()> {
        let text = std::fs::read_to_string(path)?;
        info!(file = path, "loading");
        self.load_source(&text)
    }

    pub fn instances(&self) -> usize {
        self.vms.len()
    }

    pub fn vm(&self, id: usize) -> Result<&ForthRuntime> {
        self.vms.get(id).ok_or(ForthError::NoInstance(id))
    }

    pub fn vm_mut(&mut self, id: usize) -> Result<&mut ForthRuntime> {
        self.vms.get_mut(id).ok_or(ForthError::NoInstance(id))
    }

    /// feed runs one line on one instance, on the calling thread
    pub fn feed(&mut self, id: usize, line: &str) -> Result<()> {
        self.vm_mut(id)?.process_line(line)
    }

    /// dispatch runs a batch of (instance, line) pairs. Each instance with work gets
    ///     its own thread and handles its lines in order. Returns everything written
    ///     during the cycle.
    ///
    pub fn dispatch(&mut self, work: &[(usize, &str)]) -> Result<Vec<Record>> {
        let mut batches: Vec<Vec<&str>> = vec![Vec::new(); self.vms.len()];
        for &(id, line) in work {
            batches
                .get_mut(id)
                .ok_or(ForthError::NoInstance(id))?
                .push(line);
        }
        let busy = batches.iter().filter(|b| !b.is_empty()).count();
        let dropped = self.out.dropped();
        *self.idle.running.lock() = busy;
        debug!(instances = busy, lines = work.len(), "dispatch");

        let idle = &self.idle;
        let out = &self.out;
        let vms = &mut self.vms;
        let records = thread::scope(|s| {
            for (vm, lines) in vms.iter_mut().zip(batches) {
                if lines.is_empty() {
                    continue;
                }
                s.spawn(move || {
                    let _busy = Busy(idle);
                    for line in lines {
                        if let Err(e) = vm.process_line(line) {
                            warn!(instance = vm.id, %e, "instance faulted");
                        }
                    }
                });
            }
            idle.wait();
            out.drain()
        });
        let lost = self.out.dropped() - dropped;
        if lost > 0 {
            warn!(records = lost, "output channel full, records dropped");
        }
        Ok(records)
    }

    /// Run the same line on every instance
    pub fn broadcast(&mut self, line: &str) -> Result<Vec<Record>> {
        let work: Vec<(usize, &str)> = (0..self.vms.len()).map(|id| (id, line)).collect();
        self.dispatch(&work)
    }

    /// Force an instance to STOPPED between cycles
    pub fn stop(&mut self, id: usize) -> Result<()> {
        let vm = self.vm_mut(id)?;
        vm.status = VmStatus::Stopped;
        info!(instance = id, "stopped by host");
        Ok(())
    }

    pub fn reset(&mut self, id: usize) -> Result<()> {
        self.vm_mut(id)?.reset();
        Ok(())
    }

    pub fn status(&self, id: usize) -> Result<VmStatus> {
        Ok(self.vm(id)?.status)
    }

    /// Take whatever is in the output channel
    pub fn drain(&self) -> Vec<Record> {
        self.out.drain()
    }
}
