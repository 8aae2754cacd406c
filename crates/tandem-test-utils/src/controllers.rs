//! Stock controllers wired into the end-to-end suites.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tandem_rpc::{ActionError, ActionMarkers, ControllerRegistry, SingletonScopes};

/// Records which actions ran, for asserting on side effects of
/// notifications and void calls.
#[derive(Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Poll until at least `count` entries are recorded or `timeout`
    /// elapses.  True on success.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.len() >= count
    }
}

/// Anonymous-accessible arithmetic.
pub struct MathController;

/// Anonymous-accessible grab bag used by the lifecycle suites.
pub struct HomeController {
    pub log: CallLog,
}

/// Requires authentication for every action.
pub struct SecretController;

/// The registry the end-to-end suites run against.
pub fn stock_registry() -> ControllerRegistry {
    let mut registry = ControllerRegistry::new();

    registry
        .controller::<MathController>("Math")
        .allow_anonymous()
        .action2("SumAsync", |_c, _ctx, a: i64, b: i64| async move { Ok(a + b) });

    registry
        .controller::<HomeController>("Home")
        .allow_anonymous()
        .action1("VoidOneArg", |c: Arc<HomeController>, _ctx, value: i64| async move {
            c.log.record(format!("VoidOneArg({value})"));
            Ok(())
        })
        .action1_with(
            "Log",
            ActionMarkers {
                notification: true,
                ..ActionMarkers::default()
            },
            |c: Arc<HomeController>, _ctx, line: String| async move {
                c.log.record(format!("Log({line})"));
                Ok(())
            },
        )
        .action2(
            "SlowEcho",
            |_c, _ctx, delay_ms: u64, value: i64| async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Ok(value)
            },
        )
        .action0("Fail", |_c, _ctx| async move {
            Err::<i64, _>(ActionError::Internal("controller exploded".to_owned()))
        })
        .action1("Reject", |_c, _ctx, message: String| async move {
            Err::<i64, _>(ActionError::BadRequest(message))
        });

    registry
        .controller::<SecretController>("Secret")
        .action0("Ping", |_c, _ctx| async move { Ok("pong".to_owned()) });

    registry
}

/// Singleton scopes matching [`stock_registry`]; the [`CallLog`] is shared
/// with the caller for assertions.
pub fn stock_scopes(log: CallLog) -> SingletonScopes {
    SingletonScopes::new()
        .insert("Math", MathController)
        .insert("Home", HomeController { log })
        .insert("Secret", SecretController)
}
