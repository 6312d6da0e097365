//! Named injection points for crash testing.
//!
//! A failpoint is armed either for the current thread via [`enable`] or for the
//! whole process through the comma separated `STRATA_FAILPOINTS` variable.

use std::cell::RefCell;
use std::collections::HashSet;
use std::io;
use std::sync::OnceLock;

use crate::error::{Result, StrataError};

/// Fires after an edit record is durable and before the index is mutated.
pub const AFTER_EDIT_LOGGED: &str = "recovery::after_edit_logged";
/// Fires after a checkpoint record is durable and before the snapshot copy.
pub const BEFORE_SNAPSHOT: &str = "recovery::before_snapshot";
/// Fires between two compensation records of a rollback.
pub const DURING_ROLLBACK: &str = "recovery::during_rollback";

static PROCESS_ARMED: OnceLock<HashSet<String>> = OnceLock::new();

thread_local! {
    static ARMED: RefCell<HashSet<String>> = RefCell::new(HashSet::new());
}

pub fn enable(name: &str) {
    ARMED.with(|set| {
        set.borrow_mut().insert(name.to_string());
    });
}

pub fn disable(name: &str) {
    ARMED.with(|set| {
        set.borrow_mut().remove(name);
    });
}

pub fn clear() {
    ARMED.with(|set| set.borrow_mut().clear());
}

pub fn is_enabled(name: &str) -> bool {
    if ARMED.with(|set| set.borrow().contains(name)) {
        return true;
    }
    process_armed().contains(name)
}

/// Points armed through `STRATA_FAILPOINTS`, read once per process.
fn process_armed() -> &'static HashSet<String> {
    PROCESS_ARMED.get_or_init(|| {
        std::env::var("STRATA_FAILPOINTS")
            .map(|raw| parse_list(&raw))
            .unwrap_or_default()
    })
}

fn parse_list(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Returns an I/O error when `name` is armed.
pub fn check(name: &str) -> Result<()> {
    if is_enabled(name) {
        log::warn!("failpoint triggered: {name}");
        Err(StrataError::Io(io::Error::other(format!(
            "failpoint triggered: {name}"
        ))))
    } else {
        Ok(())
    }
}
