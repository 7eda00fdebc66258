#![forbid(unsafe_code)]

//! Idempotent teardown handle.
//!
//! Returned by `Controller::add_listener`, `Subscriber::commit` and the model
//! facade's subscription methods. Unlike an RAII guard, dropping a `Release`
//! does nothing; teardown happens only when [`Release::release`] is called.
//! Calling it more than once, or from inside the notification it stops, is
//! safe.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

type Teardown = Box<dyn FnOnce()>;

/// Cloneable handle running a teardown at most once.
#[derive(Clone)]
pub struct Release {
    teardown: Rc<RefCell<Option<Teardown>>>,
}

impl Release {
    pub fn new(teardown: impl FnOnce() + 'static) -> Self {
        Self {
            teardown: Rc::new(RefCell::new(Some(Box::new(teardown)))),
        }
    }

    /// A handle that is already released.
    #[must_use]
    pub fn noop() -> Self {
        Self {
            teardown: Rc::new(RefCell::new(None)),
        }
    }

    /// Run the teardown if it has not run yet.
    pub fn release(&self) {
        let teardown = self.teardown.borrow_mut().take();
        if let Some(teardown) = teardown {
            teardown();
        }
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.teardown.borrow().is_none()
    }

    /// Combine with another handle; releasing the result releases both.
    #[must_use]
    pub fn join(self, other: Release) -> Release {
        Release::new(move || {
            self.release();
            other.release();
        })
    }
}

impl fmt::Debug for Release {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Release")
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn runs_once() {
        let count = Rc::new(Cell::new(0));
        let c = Rc::clone(&count);
        let release = Release::new(move || c.set(c.get() + 1));

        release.release();
        release.clone().release();

        assert_eq!(count.get(), 1);
        assert!(release.is_released());
    }

    #[test]
    fn noop_is_released() {
        let release = Release::noop();
        assert!(release.is_released());
        release.release();
    }

    #[test]
    fn join_releases_both() {
        let count = Rc::new(Cell::new(0));
        let (a, b) = (Rc::clone(&count), Rc::clone(&count));
        let joined = Release::new(move || a.set(a.get() + 1))
            .join(Release::new(move || b.set(b.get() + 10)));

        joined.release();
        joined.release();

        assert_eq!(count.get(), 11);
    }
}
