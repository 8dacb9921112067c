// t4 main program
//
// Boots the shared dictionary, the object heap and the VM instances, compiles
// the core and any file named on the command line, then runs the console loop.
// Errors during boot stop the program before the loop starts. Errors inside a
// line are handled by the instance that hit them and reported in its output.

mod config;
mod error;
mod internals;
mod kernel;
mod objects;
mod ostream;
mod param;
mod runtime;
mod scheduler;
mod stack;
mod value;

use config::{Config, VERSION};
use error::Result;
use internals::tui::ForthLineEditor;
use objects::{FileStore, TensorStore};
use ostream::render;
use scheduler::Scheduler;
use std::io::{self, BufRead, IsTerminal, Write};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const WELCOME_MESSAGE: &str = "Welcome to t4.";
const EXIT_MESSAGE: &str = "Finished";
const PROMPT: &str = "ok> ";

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "warn" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn boot_forth(config: &Config) -> Result<Scheduler> {
    let store = Arc::new(TensorStore::new());
    let mut forth = Scheduler::new(config.params(), Some(store.clone()))?;
    forth.set_persistence(Arc::new(FileStore::new(store)));
    forth.boot(!config.no_core)?;
    if let Some(path) = &config.loaded_file {
        forth.load_file(path)?;
    }
    // boot output (errors in loaded files, .( messages) goes to the console
    print!("{}", render(&forth.drain(), false));
    Ok(forth)
}

/// Where a console line goes: `@n text` for instance n, `@* text` for all of them
enum Route<'a> {
    One(usize, &'a str),
    All(&'a str),
}

/// Host commands, given in place of Forth text: `@2 !reset`, `@* !status`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Stop,
    Reset,
    Status,
}

fn command(text: &str) -> Option<Command> {
    match text.trim() {
        "!stop" => Some(Command::Stop),
        "!reset" => Some(Command::Reset),
        "!status" => Some(Command::Status),
        _ => None,
    }
}

/// Apply a host command to one instance and describe the outcome
fn host_command(forth: &mut Scheduler, id: usize, cmd: Command) -> String {
    let done = match cmd {
        Command::Stop => forth.stop(id),
        Command::Reset => forth.reset(id),
        Command::Status => Ok(()),
    };
    match done.and_then(|_| forth.status(id)) {
        Ok(status) => format!("[{id}] {status:?}\n"),
        Err(e) => format!("{e}\n"),
    }
}

fn route(line: &str) -> Route<'_> {
    let Some(rest) = line.strip_prefix('@') else {
        return Route::One(0, line);
    };
    let (target, text) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    if target == "*" {
        return Route::All(text);
    }
    match target.parse() {
        Ok(id) => Route::One(id, text),
        Err(_) => Route::One(0, line),
    }
}

/// Run one console line. Returns false once instance 0 has stopped.
fn handle_line(forth: &mut Scheduler, line: &str) -> bool {
    let targets = match route(line) {
        Route::One(id, text) => command(text).map(|cmd| (vec![id], cmd)),
        Route::All(text) => command(text).map(|cmd| ((0..forth.instances()).collect(), cmd)),
    };
    if let Some((ids, cmd)) = targets {
        for id in ids {
            print!("{}", host_command(forth, id, cmd));
        }
        let _ = io::stdout().flush();
        return !stopped(forth);
    }
    let records = match route(line) {
        Route::One(id, text) => forth.dispatch(&[(id, text)]),
        Route::All(text) => forth.broadcast(text),
    };
    match records {
        Ok(records) => {
            let text = render(&records, forth.instances() > 1);
            print!("{text}");
            if !text.is_empty() && !text.ends_with('\n') {
                println!();
            }
        }
        Err(e) => println!("{e}"),
    }
    let _ = io::stdout().flush();
    !stopped(forth)
}

/// The session ends with instance 0
fn stopped(forth: &Scheduler) -> bool {
    forth.vm(0).map_or(true, |vm| vm.should_exit())
}

fn run_forth(forth: &mut Scheduler) -> io::Result<()> {
    println!("{WELCOME_MESSAGE} Version {VERSION}");
    if io::stdin().is_terminal() {
        let mut editor = ForthLineEditor::new(PROMPT);
        while let Some(line) = editor.read_line()? {
            if !handle_line(forth, &line) {
                break;
            }
        }
    } else {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            if !handle_line(forth, &line?) {
                break;
            }
            print!("{PROMPT}");
            io::stdout().flush()?;
        }
    }
    println!("{EXIT_MESSAGE}");
    Ok(())
}

fn main() {
    let config = Config::process_args();
    init_logging(config.verbose);
    info!(version = VERSION, "starting");

    let mut forth = match boot_forth(&config) {
        Ok(forth) => forth,
        Err(e) => {
            error!(%e, "boot failed");
            eprintln!("Fatal error during initialization: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = run_forth(&mut forth) {
        error!(%e, "console failed");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::VmStatus;

    #[test]
    fn test_routing() {
        assert!(matches!(route("1 2 +"), Route::One(0, "1 2 +")));
        assert!(matches!(route("@3 words"), Route::One(3, "words")));
        assert!(matches!(route("@* 1 ."), Route::All("1 .")));
        assert!(matches!(route("@x dup"), Route::One(0, "@x dup")));
    }

    fn two_instances() -> Scheduler {
        let params = config::Params {
            instances: 2,
            ..config::Params::default()
        };
        let mut forth = Scheduler::new(params, None).unwrap();
        forth.boot(false).unwrap();
        forth
    }

    #[test]
    fn test_bye_ends_the_session() {
        let mut forth = Scheduler::new(config::Params::default(), None).unwrap();
        forth.boot(false).unwrap();
        assert!(handle_line(&mut forth, "1 ."));
        assert!(!handle_line(&mut forth, "bye"));
    }

    #[test]
    fn test_host_commands() {
        assert_eq!(command(" !stop "), Some(Command::Stop));
        assert_eq!(command("!reset"), Some(Command::Reset));
        assert_eq!(command("!status"), Some(Command::Status));
        assert_eq!(command("stop"), None);

        let mut forth = two_instances();
        assert_eq!(host_command(&mut forth, 1, Command::Stop), "[1] Stopped\n");
        assert!(handle_line(&mut forth, "@1 1 ."));
        assert_eq!(forth.status(1).unwrap(), VmStatus::Stopped);
        assert_eq!(host_command(&mut forth, 1, Command::Reset), "[1] Ready\n");
        assert_eq!(host_command(&mut forth, 7, Command::Status), "no instance 7\n");
        assert!(handle_line(&mut forth, "@* !status"));
    }

    #[test]
    fn test_stopping_instance_zero_ends_the_session() {
        let mut forth = two_instances();
        assert!(handle_line(&mut forth, "@1 !stop"));
        assert!(!handle_line(&mut forth, "@0 !stop"));
        assert!(handle_line(&mut forth, "@0 !reset"));
    }

    #[test]
    fn test_boot_wires_the_object_heap() {
        let config = Config {
            loaded_file: None,
            no_core: false,
            instances: 1,
            group: 1,
            obuf: config::DEFAULT_OBUF_SIZE,
            arena: config::DEFAULT_ARENA_SIZE,
            stack: config::DEFAULT_STACK_SIZE,
            case_sensitive: false,
            verbose: false,
        };
        let mut forth = boot_forth(&config).unwrap();
        let records = forth.dispatch(&[(0, "2 2 matrix { 1 2 3 4 } dup transpose matmul sum .")]).unwrap();
        assert_eq!(render(&records, false), "52 ");
        let records = forth.dispatch(&[(0, "3 vector ones dup .")]).unwrap();
        assert_eq!(render(&records, false), "tensor[3]{ 1 1 1 } ");
    }
}
