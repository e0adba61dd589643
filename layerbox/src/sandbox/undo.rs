//! LIFO teardown stack.

use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::warn;

use crate::errors::{SandboxError, panic_message};

type UndoFn = Box<dyn FnOnce() -> Result<(), SandboxError>>;

/// Teardown steps registered as setup progresses.
///
/// `unwind` runs them newest first. Every step runs even if earlier ones
/// fail or panic; all failures are returned. A stack dropped without
/// `unwind` still runs its steps and logs the failures.
#[derive(Default)]
pub struct UndoStack {
    steps: Vec<UndoFn>,
}

impl UndoStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: impl FnOnce() -> Result<(), SandboxError> + 'static) {
        self.steps.push(Box::new(step));
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step, newest first, and collect failures in that order.
    pub fn unwind(mut self) -> Vec<SandboxError> {
        self.run_all()
    }

    fn run_all(&mut self) -> Vec<SandboxError> {
        let mut errors = Vec::new();
        while let Some(step) = self.steps.pop() {
            match catch_unwind(AssertUnwindSafe(step)) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push(e),
                Err(payload) => errors.push(SandboxError::Panicked(panic_message(payload.as_ref()))),
            }
        }
        errors
    }
}

impl Drop for UndoStack {
    fn drop(&mut self) {
        for err in self.run_all() {
            warn!("teardown: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::io;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::rc::Rc;

    fn recorder() -> (Rc<RefCell<Vec<u32>>>, impl Fn(u32) -> UndoFn) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let log2 = log.clone();
        let make = move |n: u32| -> UndoFn {
            let log = log2.clone();
            Box::new(move || {
                log.borrow_mut().push(n);
                Ok(())
            })
        };
        (log, make)
    }

    #[test]
    fn test_unwind_is_lifo() {
        let (log, make) = recorder();
        let mut stack = UndoStack::new();
        for n in 1..=3 {
            stack.push(make(n));
        }
        assert_eq!(stack.len(), 3);

        assert!(stack.unwind().is_empty());
        assert_eq!(*log.borrow(), vec![3, 2, 1]);
    }

    #[test]
    fn test_failures_do_not_stop_remaining_steps() {
        let (log, make) = recorder();
        let mut stack = UndoStack::new();
        stack.push(make(1));
        stack.push(|| {
            Err(SandboxError::Restore {
                step: "chroot",
                source: io::Error::from_raw_os_error(libc::EPERM),
            })
        });
        stack.push(|| panic!("boom"));
        stack.push(make(4));

        let errors = stack.unwind();

        assert_eq!(*log.borrow(), vec![4, 1]);
        assert_eq!(errors.len(), 2);
        assert!(matches!(&errors[0], SandboxError::Panicked(m) if m == "boom"));
        assert!(matches!(&errors[1], SandboxError::Restore { .. }));
    }

    #[test]
    fn test_drop_runs_pending_steps() {
        let (log, make) = recorder();
        {
            let mut stack = UndoStack::new();
            stack.push(make(1));
            stack.push(make(2));
        }
        assert_eq!(*log.borrow(), vec![2, 1]);
    }

    #[test]
    fn test_panic_in_scope_still_unwinds_lifo() {
        let (log, make) = recorder();
        let result = catch_unwind(AssertUnwindSafe(|| {
            let mut stack = UndoStack::new();
            stack.push(make(1));
            stack.push(make(2));
            stack.push(make(3));
            panic!("task failed");
        }));

        assert!(result.is_err());
        assert_eq!(*log.borrow(), vec![3, 2, 1]);
    }

    #[test]
    fn test_task_panic_then_panicking_step_keeps_order() {
        let (log, make) = recorder();
        let mut stack = UndoStack::new();
        stack.push(make(1));
        stack.push(make(2));
        stack.push(|| panic!("unmount"));
        stack.push(make(4));

        let mut errors = Vec::new();
        if let Err(payload) = catch_unwind(|| {
            panic!("task");
        }) {
            errors.push(SandboxError::Panicked(panic_message(payload.as_ref())));
        }
        errors.extend(stack.unwind());

        assert_eq!(*log.borrow(), vec![4, 2, 1]);
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        assert_eq!(
            messages,
            vec!["panic inside chroot: task", "panic inside chroot: unmount"]
        );
    }
}
