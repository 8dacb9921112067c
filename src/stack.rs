// Fixed capacity stacks

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackError {
    StackEmpty,
    StackFull,
}

/// A bounded LIFO. Pushing past capacity and popping when empty are errors,
/// never reallocations or panics.
#[derive(Debug)]
pub struct Stack<T> {
    data: Vec<T>,
    capacity: usize,
}

impl<T: Copy> Stack<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) -> Result<(), StackError> {
        if self.data.len() >= self.capacity {
            return Err(StackError::StackFull);
        }
        self.data.push(item);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<T, StackError> {
        self.data.pop().ok_or(StackError::StackEmpty)
    }

    /// Item `n` places below the top; 0 is the top itself
    pub fn peek(&self, n: usize) -> Result<T, StackError> {
        let len = self.data.len();
        if n >= len {
            return Err(StackError::StackEmpty);
        }
        Ok(self.data[len - 1 - n])
    }

    /// Replace the top item in place
    pub fn set_top(&mut self, item: T) -> Result<(), StackError> {
        match self.data.last_mut() {
            Some(top) => {
                *top = item;
                Ok(())
            }
            None => Err(StackError::StackEmpty),
        }
    }

    pub fn depth(&self) -> usize {
        self.data.len()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Bottom-to-top view, for dumps
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop() {
        let mut s: Stack<i32> = Stack::new(3);
        s.push(1).unwrap();
        s.push(2).unwrap();
        assert_eq!(s.depth(), 2);
        assert_eq!(s.pop(), Ok(2));
        assert_eq!(s.pop(), Ok(1));
        assert_eq!(s.pop(), Err(StackError::StackEmpty));
    }

    #[test]
    fn test_overflow() {
        let mut s: Stack<u8> = Stack::new(2);
        s.push(1).unwrap();
        s.push(2).unwrap();
        assert_eq!(s.push(3), Err(StackError::StackFull));
        assert_eq!(s.depth(), 2);
    }

    #[test]
    fn test_peek_and_set_top() {
        let mut s: Stack<i32> = Stack::new(4);
        s.push(10).unwrap();
        s.push(20).unwrap();
        assert_eq!(s.peek(0), Ok(20));
        assert_eq!(s.peek(1), Ok(10));
        assert_eq!(s.peek(2), Err(StackError::StackEmpty));
        s.set_top(21).unwrap();
        assert_eq!(s.as_slice(), &[10, 21]);
        s.clear();
        assert_eq!(s.set_top(1), Err(StackError::StackEmpty));
    }
}
