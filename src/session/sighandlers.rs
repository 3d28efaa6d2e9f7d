use crate::{
    kernel_supplement::NUM_SIGNALS,
    remote_ptr::{RemotePtr, Void},
    sig::Sig,
};
use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

pub type SighandlersSharedPtr = Rc<RefCell<Sighandlers>>;
pub type SighandlersSharedWeakPtr = Weak<RefCell<Sighandlers>>;

/// The tracee's disposition for one signal.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SigAction {
    Default,
    Ignore,
    UserHandler {
        handler: RemotePtr<Void>,
        flags: usize,
        restorer: RemotePtr<Void>,
        mask: u64,
    },
}

/// What the tracee would do on delivery, given the disposition.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SignalDisposition {
    SignalDefault,
    SignalIgnore,
    SignalHandler,
}

#[derive(Clone, Debug)]
pub struct Sighandler {
    pub action: SigAction,
    /// SA_RESETHAND: the disposition reverts to default when the handler
    /// fires.
    pub resethand: bool,
}

impl Default for Sighandler {
    fn default() -> Self {
        Sighandler {
            action: SigAction::Default,
            resethand: false,
        }
    }
}

impl Sighandler {
    pub fn disposition(&self) -> SignalDisposition {
        match self.action {
            SigAction::Default => SignalDisposition::SignalDefault,
            SigAction::Ignore => SignalDisposition::SignalIgnore,
            SigAction::UserHandler { .. } => SignalDisposition::SignalHandler,
        }
    }

    pub fn is_user_handler(&self) -> bool {
        matches!(self.action, SigAction::UserHandler { .. })
    }
}

/// The per-address-space table of signal dispositions, indexed by signal
/// number. Shared across tasks per CLONE_SIGHAND; cloned on fork; user
/// handlers collapse to default on exec while ignore dispositions persist.
pub struct Sighandlers {
    handlers: Vec<Sighandler>,
}

impl Sighandlers {
    pub fn new() -> SighandlersSharedPtr {
        Rc::new(RefCell::new(Sighandlers {
            handlers: vec![Sighandler::default(); NUM_SIGNALS],
        }))
    }

    pub fn get(&self, sig: Sig) -> &Sighandler {
        &self.handlers[sig.as_raw() as usize]
    }

    pub fn get_mut(&mut self, sig: Sig) -> &mut Sighandler {
        &mut self.handlers[sig.as_raw() as usize]
    }

    /// Record a tracee sigaction() that installed `action`.
    pub fn set(&mut self, sig: Sig, action: SigAction, resethand: bool) {
        let h = &mut self.handlers[sig.as_raw() as usize];
        h.action = action;
        h.resethand = resethand;
    }

    /// The handler fired with SA_RESETHAND: revert to default.
    pub fn reset_handler_if_resethand(&mut self, sig: Sig) {
        let h = &mut self.handlers[sig.as_raw() as usize];
        if h.resethand {
            h.action = SigAction::Default;
            h.resethand = false;
        }
    }

    /// exec() semantics: user handlers collapse to default; ignore
    /// dispositions persist.
    pub fn reset_user_handlers(&mut self) {
        for h in self.handlers.iter_mut() {
            if h.is_user_handler() {
                h.action = SigAction::Default;
            }
            h.resethand = false;
        }
    }

    /// A fork child starts with a copy of the parent's table.
    pub fn clone_table(&self) -> SighandlersSharedPtr {
        Rc::new(RefCell::new(Sighandlers {
            handlers: self.handlers.clone(),
        }))
    }

    pub fn disposition_of(&self, sig: Sig) -> SignalDisposition {
        self.get(sig).disposition()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sig;

    fn user_handler() -> SigAction {
        SigAction::UserHandler {
            handler: RemotePtr::new(0x1000),
            flags: 0,
            restorer: RemotePtr::null(),
            mask: 0,
        }
    }

    #[test]
    fn default_table() {
        let table = Sighandlers::new();
        assert_eq!(
            table.borrow().disposition_of(sig::SIGALRM),
            SignalDisposition::SignalDefault
        );
    }

    #[test]
    fn exec_resets_handlers_but_keeps_ignore() {
        let table = Sighandlers::new();
        {
            let mut t = table.borrow_mut();
            t.set(sig::SIGUSR1, user_handler(), true);
            t.set(sig::SIGCHLD, SigAction::Ignore, false);
        }
        table.borrow_mut().reset_user_handlers();
        assert_eq!(
            table.borrow().disposition_of(sig::SIGUSR1),
            SignalDisposition::SignalDefault
        );
        assert_eq!(
            table.borrow().disposition_of(sig::SIGCHLD),
            SignalDisposition::SignalIgnore
        );
    }

    #[test]
    fn resethand_reverts_once() {
        let table = Sighandlers::new();
        table.borrow_mut().set(sig::SIGSEGV, user_handler(), true);
        table.borrow_mut().reset_handler_if_resethand(sig::SIGSEGV);
        assert_eq!(
            table.borrow().disposition_of(sig::SIGSEGV),
            SignalDisposition::SignalDefault
        );

        // Without resethand the handler persists.
        table.borrow_mut().set(sig::SIGSEGV, user_handler(), false);
        table.borrow_mut().reset_handler_if_resethand(sig::SIGSEGV);
        assert_eq!(
            table.borrow().disposition_of(sig::SIGSEGV),
            SignalDisposition::SignalHandler
        );
    }

    #[test]
    fn fork_clone_is_independent(){
        let table = Sighandlers::new();
        table.borrow_mut().set(sig::SIGUSR2, user_handler(), false);
        let clone = table.borrow().clone_table();
        clone.borrow_mut().set(sig::SIGUSR2, SigAction::Default, false);
        assert_eq!(
            table.borrow().disposition_of(sig::SIGUSR2),
            SignalDisposition::SignalHandler
        );
        assert_eq!(
            clone.borrow().disposition_of(sig::SIGUSR2),
            SignalDisposition::SignalDefault
        );
    }
}
