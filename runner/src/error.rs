use std::{error::Error, io};
use thiserror::Error;

/// Failures reported by the compute service or the object store.
///
/// Every variant except `NotFound` and `AlreadyExists` is considered transient by the polling
/// loops, they swallow it up to their error ceiling.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: &'static str, id: String },
    #[error("remote request rejected: {0}")]
    Rejected(String),
    #[error("remote I/O failed")]
    Io(#[from] io::Error),
    #[error("failed to (de)serialize remote record")]
    Serialization(#[from] serde_yaml::Error),
}

impl RemoteError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn already_exists(kind: &'static str, id: impl ToString) -> Self {
        Self::AlreadyExists {
            kind,
            id: id.to_string(),
        }
    }
}

/// Walk the `source()` chain down to the innermost cause.
///
/// Grouped failures (a batch of transfers, a wrapped remote call) surface their most specific
/// error to the user instead of the generic outer message.
pub fn root_cause<'a>(error: &'a (dyn Error + 'static)) -> &'a (dyn Error + 'static) {
    let mut current = error;

    while let Some(source) = current.source() {
        current = source;
    }

    current
}

/// Render the full chain as `outer: inner: innermost`
pub fn chain(error: &(dyn Error + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut current = error;

    while let Some(source) = current.source() {
        rendered.push_str(": ");
        rendered.push_str(&source.to_string());
        current = source;
    }

    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Error, Debug)]
    #[error("batch failed")]
    struct Batch(#[source] RemoteError);

    #[test]
    pub fn root_cause_unwraps_to_innermost() {
        let error = Batch(RemoteError::Io(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        )));

        assert_eq!(root_cause(&error).to_string(), "connection reset by peer");
        assert_eq!(
            chain(&error),
            "batch failed: remote I/O failed: connection reset by peer"
        );
    }

    #[test]
    pub fn root_cause_of_leaf_is_itself() {
        let error = RemoteError::not_found("job", "abc");

        assert_eq!(root_cause(&error).to_string(), "job abc not found");
    }
}
