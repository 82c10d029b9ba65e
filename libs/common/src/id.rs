use ulid::Ulid;

/// `{prefix}_{ulid}`. ULIDs sort by creation time, so ids of one kind do too.
///
/// ```
/// let id = iris_common::id::prefixed_ulid(iris_common::id::prefix::CONNECTION);
/// assert!(id.starts_with("conn_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{prefix}_{}", Ulid::new())
}

/// Row or handle types whose ids carry a fixed prefix.
pub trait PrefixedId {
    const PREFIX: &'static str;

    fn generate() -> String {
        prefixed_ulid(Self::PREFIX)
    }
}

pub mod prefix {
    /// Stored job applications.
    pub const JOB_APPLICATION: &str = "japp";
    /// One open event stream; only appears in logs.
    pub const CONNECTION: &str = "conn";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_application_ids_carry_prefix_and_ulid() {
        let id = prefixed_ulid(prefix::JOB_APPLICATION);
        let (kind, ulid) = id.split_once('_').unwrap();
        assert_eq!(kind, "japp");
        assert!(ulid.parse::<Ulid>().is_ok());
    }

    #[test]
    fn connection_ids_differ() {
        assert_ne!(
            prefixed_ulid(prefix::CONNECTION),
            prefixed_ulid(prefix::CONNECTION)
        );
    }
}
