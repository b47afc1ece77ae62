//! Process-instance identity.
//!
//! Every running process gets a single identifier, generated once at
//! startup and held for the lifetime of the process. It is attached to
//! jobs as they are claimed so that a crashed or restarted process can
//! be told apart from the one currently holding a claim, without ever
//! persisting anything beyond the job rows that reference it.

use once_cell::sync::Lazy;
use uuid::Uuid;

static INSTANCE_ID: Lazy<Uuid> = Lazy::new(Uuid::new_v4);

/// Returns the identifier for this process. Stable for the life of the
/// process, different across restarts.
pub fn instance_id() -> Uuid {
    *INSTANCE_ID
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_id_stable() {
        let a = instance_id();
        let b = instance_id();
        assert_eq!(a, b);
    }
}
