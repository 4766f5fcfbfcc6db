//! Actions: the callables a state runs once per entry.
//!
//! An action is either synchronous or asynchronous, decided once at construction by
//! which constructor built it. Each action declares the store keys it may touch and
//! receives an [`ActionArgs`] view restricted to exactly those keys; reaching for any
//! other key is a configuration fault.

use super::cancel::RunControl;
use super::store::{GlobalArgumentStore, StoreMap};
use crate::core::Selector;
use crate::error::{AppResult, SequencerError};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

/// What an action callable returns.
pub type ActionResult = Result<(), SequencerError>;

type SyncCallable = dyn Fn(ActionArgs) -> ActionResult + Send + Sync;
type AsyncCallable = dyn Fn(ActionArgs) -> BoxFuture<'static, ActionResult> + Send + Sync;

#[derive(Clone)]
enum Callable {
    Sync(Arc<SyncCallable>),
    Async(Arc<AsyncCallable>),
}

/// A registered callable plus the store keys it was granted.
#[derive(Clone)]
pub struct Action {
    name: String,
    keys: Arc<[String]>,
    callable: Callable,
    flags_error: bool,
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("name", &self.name)
            .field("keys", &self.keys)
            .field("is_async", &self.is_async())
            .field("flags_error", &self.flags_error)
            .finish()
    }
}

/// How an action ended, from the state's point of view.
#[derive(Debug)]
pub(crate) enum ActionError {
    /// Raise the state's error flag.
    Flagged { action: String, error: SequencerError },
    /// Stop the machine.
    Fatal(SequencerError),
}

impl Action {
    /// Wrap a plain function.
    pub fn sync<F>(name: impl Into<String>, keys: &[&str], callable: F) -> Self
    where
        F: Fn(ActionArgs) -> ActionResult + Send + Sync + 'static,
    {
        Self::build(name, keys, Callable::Sync(Arc::new(callable)))
    }

    /// Wrap a function returning a future.
    pub fn asynchronous<F, Fut>(name: impl Into<String>, keys: &[&str], callable: F) -> Self
    where
        F: Fn(ActionArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionResult> + Send + 'static,
    {
        let boxed = move |args: ActionArgs| -> BoxFuture<'static, ActionResult> {
            Box::pin(callable(args))
        };
        Self::build(name, keys, Callable::Async(Arc::new(boxed)))
    }

    fn build(name: impl Into<String>, keys: &[&str], callable: Callable) -> Self {
        Self {
            name: name.into(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
            callable,
            flags_error: true,
        }
    }

    /// Log failures instead of raising the state's error flag.
    pub fn without_error_flag(mut self) -> Self {
        self.flags_error = false;
        self
    }

    /// Name given at construction.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store keys the action was granted.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Whether the action was built with [`Action::asynchronous`].
    pub fn is_async(&self) -> bool {
        matches!(self.callable, Callable::Async(_))
    }

    pub(crate) fn args(&self, store: Arc<GlobalArgumentStore>, control: RunControl) -> ActionArgs {
        ActionArgs {
            action: Arc::from(self.name.as_str()),
            keys: Arc::clone(&self.keys),
            store,
            control,
        }
    }

    /// Run a synchronous action. Asynchronous actions are rejected as a fault.
    pub(crate) fn exec(&self, args: ActionArgs) -> Result<(), ActionError> {
        match &self.callable {
            Callable::Sync(callable) => self.classify(callable(args)),
            Callable::Async(_) => Err(ActionError::Fatal(SequencerError::Configuration(
                format!("Action '{}' is asynchronous", self.name),
            ))),
        }
    }

    /// Run an action to completion, awaiting it if asynchronous.
    pub(crate) async fn async_exec(&self, args: ActionArgs) -> Result<(), ActionError> {
        match &self.callable {
            Callable::Async(callable) => self.classify(callable(args).await),
            Callable::Sync(callable) => self.classify(callable(args)),
        }
    }

    fn classify(&self, result: ActionResult) -> Result<(), ActionError> {
        match result {
            Ok(()) => Ok(()),
            Err(error) if error.is_fatal() => Err(ActionError::Fatal(error)),
            Err(error) if self.flags_error => Err(ActionError::Flagged {
                action: self.name.clone(),
                error,
            }),
            Err(error) => {
                warn!(action = %self.name, %error, "Action failed");
                Ok(())
            }
        }
    }
}

/// An action's view of the store, limited to its granted keys.
#[derive(Clone, Debug)]
pub struct ActionArgs {
    action: Arc<str>,
    keys: Arc<[String]>,
    store: Arc<GlobalArgumentStore>,
    control: RunControl,
}

impl ActionArgs {
    fn check(&self, key: &str) -> AppResult<()> {
        if self.keys.iter().any(|k| k == key) {
            Ok(())
        } else {
            Err(SequencerError::UnregisteredKey {
                action: self.action.to_string(),
                key: key.to_string(),
            })
        }
    }

    /// Name of the running action.
    pub fn action(&self) -> &str {
        &self.action
    }

    /// Cancellation and pause state of the current entry.
    pub fn control(&self) -> &RunControl {
        &self.control
    }

    /// Read granted entries. `Selector::All` means every granted key.
    pub fn get(&self, selector: &Selector) -> AppResult<StoreMap> {
        let selector = match selector {
            Selector::All => Selector::Keys(self.keys.to_vec()),
            Selector::Key(key) => {
                self.check(key)?;
                selector.clone()
            }
            Selector::Keys(keys) => {
                for key in keys {
                    self.check(key)?;
                }
                selector.clone()
            }
        };
        Ok(self.store.get(&selector))
    }

    /// Raw value of a granted key.
    pub fn value(&self, key: &str) -> AppResult<Option<Value>> {
        self.check(key)?;
        Ok(self.store.value(key))
    }

    /// Typed value of a granted key.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> AppResult<Option<T>> {
        self.check(key)?;
        self.store.get_as(key)
    }

    /// Like `get_as`, but an absent key is an error.
    pub fn require_as<T: DeserializeOwned>(&self, key: &str) -> AppResult<T> {
        self.get_as(key)?
            .ok_or_else(|| SequencerError::MissingKey(key.to_string()))
    }

    /// Merge `partial` into the store. Every key must be granted.
    pub fn set(&self, partial: StoreMap) -> AppResult<()> {
        for key in partial.keys() {
            self.check(key)?;
        }
        self.store.set(partial);
        Ok(())
    }

    /// Store a typed value under a granted key.
    pub fn set_as<T: Serialize>(&self, key: &str, value: &T) -> AppResult<()> {
        self.check(key)?;
        self.store.set_as(key, value)
    }

    /// Remove a granted key.
    pub fn remove(&self, key: &str) -> AppResult<Option<Value>> {
        self.check(key)?;
        Ok(self.store.remove(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args_for(action: &Action, store: &Arc<GlobalArgumentStore>) -> ActionArgs {
        action.args(Arc::clone(store), RunControl::new())
    }

    #[test]
    fn test_classification_is_fixed_at_construction() {
        let plain = Action::sync("plain", &[], |_| Ok(()));
        let awaiting = Action::asynchronous("awaiting", &[], |_| async { Ok(()) });
        assert!(!plain.is_async());
        assert!(awaiting.is_async());
    }

    #[test]
    fn test_ungranted_key_is_fatal() {
        let store = Arc::new(GlobalArgumentStore::new());
        store.insert("Control", json!({}));
        let action = Action::sync("peek", &["Mode"], |args| {
            args.value("Control")?;
            Ok(())
        });

        let result = action.exec(args_for(&action, &store));
        assert!(matches!(
            result,
            Err(ActionError::Fatal(SequencerError::UnregisteredKey { .. }))
        ));
    }

    #[test]
    fn test_all_selector_limits_to_granted_keys() {
        let store = Arc::new(GlobalArgumentStore::new());
        store.insert("Mode", json!("auto"));
        store.insert("Secret", json!(1));
        let action = Action::sync("peek", &["Mode"], |_| Ok(()));
        let view = args_for(&action, &store).get(&Selector::All).unwrap();
        assert_eq!(view.keys().collect::<Vec<_>>(), vec!["Mode"]);
    }

    #[tokio::test]
    async fn test_failure_flags_unless_disabled() {
        let store = Arc::new(GlobalArgumentStore::new());
        let failing = Action::asynchronous("failing", &[], |_| async {
            Err(SequencerError::Measurement("no light".into()))
        });
        assert!(matches!(
            failing.async_exec(args_for(&failing, &store)).await,
            Err(ActionError::Flagged { .. })
        ));

        let tolerated = failing.clone().without_error_flag();
        assert!(tolerated
            .async_exec(args_for(&tolerated, &store))
            .await
            .is_ok());
    }

    #[test]
    fn test_writes_are_checked() {
        let store = Arc::new(GlobalArgumentStore::new());
        let action = Action::sync("writer", &["Mode"], |args| {
            args.set_as("Mode", &"manual")?;
            Ok(())
        });
        action.exec(args_for(&action, &store)).unwrap();
        assert_eq!(store.value("Mode"), Some(json!("manual")));

        let args = args_for(&action, &store);
        assert!(args.set_as("Cursor", &0).is_err());
    }
}
