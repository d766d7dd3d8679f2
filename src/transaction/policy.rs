//! Error and adoption policies, and the ambient policy stack.
//!
//! The error policy for an operation is resolved in this order:
//! 1. the policy pushed by the innermost transactional function running on
//!    the current thread,
//! 2. the policy configured on the scope instance,
//! 3. the manager-wide default.

use std::collections::HashMap;
use std::fmt;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::session::TxnOrigin;

/// What a failed resource operation does after it has been rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Return the error to the caller.
    #[default]
    Raise,
    /// Report it through the operation's status only.
    Swallow,
}

impl ErrorPolicy {
    pub fn raises(&self) -> bool {
        matches!(self, ErrorPolicy::Raise)
    }
}

impl fmt::Display for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorPolicy::Raise => write!(f, "raise"),
            ErrorPolicy::Swallow => write!(f, "swallow"),
        }
    }
}

impl std::str::FromStr for ErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "raise" => Ok(ErrorPolicy::Raise),
            "swallow" => Ok(ErrorPolicy::Swallow),
            _ => Err(format!("unknown error policy: {}", s)),
        }
    }
}

/// What a root scope does when the session already has an open transaction
/// that no scope began.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExistingTxnPolicy {
    /// Refuse to enter.
    #[default]
    Error,
    /// Adopt it only if the session started it lazily.
    AdoptAutobegin,
    /// Adopt any open transaction.
    Adopt,
}

impl ExistingTxnPolicy {
    /// Check if a transaction of this origin may be adopted as the root.
    pub fn adopts(&self, origin: TxnOrigin) -> bool {
        match self {
            ExistingTxnPolicy::Error => false,
            ExistingTxnPolicy::AdoptAutobegin => origin == TxnOrigin::Autobegin,
            ExistingTxnPolicy::Adopt => true,
        }
    }
}

impl fmt::Display for ExistingTxnPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExistingTxnPolicy::Error => write!(f, "error"),
            ExistingTxnPolicy::AdoptAutobegin => write!(f, "adopt_autobegin"),
            ExistingTxnPolicy::Adopt => write!(f, "adopt"),
        }
    }
}

impl std::str::FromStr for ExistingTxnPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "error" => Ok(ExistingTxnPolicy::Error),
            "adopt_autobegin" => Ok(ExistingTxnPolicy::AdoptAutobegin),
            "adopt" => Ok(ExistingTxnPolicy::Adopt),
            _ => Err(format!("unknown existing-transaction policy: {}", s)),
        }
    }
}

/// Pick the effective policy from the three sources, highest priority first.
pub fn resolve(
    ambient: Option<ErrorPolicy>,
    instance: Option<ErrorPolicy>,
    default: ErrorPolicy,
) -> ErrorPolicy {
    ambient.or(instance).unwrap_or(default)
}

/// Per-thread stack of policies pushed by running transactional functions.
#[derive(Debug, Default)]
pub(crate) struct PolicyStack {
    frames: Mutex<HashMap<ThreadId, Vec<ErrorPolicy>>>,
}

impl PolicyStack {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Push a policy for the current thread until the frame is dropped.
    pub(crate) fn push(&self, policy: ErrorPolicy) -> PolicyFrame<'_> {
        let thread = thread::current().id();
        self.frames.lock().entry(thread).or_default().push(policy);
        PolicyFrame {
            stack: self,
            thread,
        }
    }

    /// Innermost policy on the current thread.
    pub(crate) fn current(&self) -> Option<ErrorPolicy> {
        let thread = thread::current().id();
        self.frames
            .lock()
            .get(&thread)
            .and_then(|frames| frames.last().copied())
    }

    fn pop(&self, thread: ThreadId) {
        let mut frames = self.frames.lock();
        if let Some(stack) = frames.get_mut(&thread) {
            stack.pop();
            if stack.is_empty() {
                frames.remove(&thread);
            }
        }
    }
}

/// RAII frame for one pushed policy.
pub(crate) struct PolicyFrame<'a> {
    stack: &'a PolicyStack,
    thread: ThreadId,
}

impl Drop for PolicyFrame<'_> {
    fn drop(&mut self) {
        self.stack.pop(self.thread);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert_eq!(ErrorPolicy::default(), ErrorPolicy::Raise);
        assert_eq!(ExistingTxnPolicy::default(), ExistingTxnPolicy::Error);
    }

    #[test]
    fn test_parse_policies() {
        assert_eq!("swallow".parse::<ErrorPolicy>().unwrap(), ErrorPolicy::Swallow);
        assert_eq!("RAISE".parse::<ErrorPolicy>().unwrap(), ErrorPolicy::Raise);
        assert!("ignore".parse::<ErrorPolicy>().is_err());
        assert_eq!(
            "adopt-autobegin".parse::<ExistingTxnPolicy>().unwrap(),
            ExistingTxnPolicy::AdoptAutobegin
        );
        assert_eq!(ExistingTxnPolicy::AdoptAutobegin.to_string(), "adopt_autobegin");
    }

    #[test]
    fn test_adoption() {
        assert!(!ExistingTxnPolicy::Error.adopts(TxnOrigin::Autobegin));
        assert!(ExistingTxnPolicy::AdoptAutobegin.adopts(TxnOrigin::Autobegin));
        assert!(!ExistingTxnPolicy::AdoptAutobegin.adopts(TxnOrigin::Explicit));
        assert!(ExistingTxnPolicy::Adopt.adopts(TxnOrigin::Explicit));
    }

    #[test]
    fn test_resolution_order() {
        use ErrorPolicy::*;
        assert_eq!(resolve(Some(Swallow), Some(Raise), Raise), Swallow);
        assert_eq!(resolve(None, Some(Swallow), Raise), Swallow);
        assert_eq!(resolve(None, None, Swallow), Swallow);
    }

    #[test]
    fn test_stack_frames_nest() {
        let stack = PolicyStack::new();
        assert_eq!(stack.current(), None);
        {
            let _outer = stack.push(ErrorPolicy::Swallow);
            {
                let _inner = stack.push(ErrorPolicy::Raise);
                assert_eq!(stack.current(), Some(ErrorPolicy::Raise));
            }
            assert_eq!(stack.current(), Some(ErrorPolicy::Swallow));
        }
        assert_eq!(stack.current(), None);
    }

    #[test]
    fn test_stack_is_per_thread() {
        let stack = std::sync::Arc::new(PolicyStack::new());
        let _frame = stack.push(ErrorPolicy::Swallow);
        let other = std::sync::Arc::clone(&stack);
        let seen = thread::spawn(move || other.current()).join().unwrap();
        assert_eq!(seen, None);
    }
}
