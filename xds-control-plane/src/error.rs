use thiserror::Error;
use tonic::Status;

/// Terminal conditions of a discovery stream.
#[derive(Debug, Error)]
pub enum StreamError {
    /// An ADS request arrived without a type URL. Protocol violation; the
    /// stream fails.
    #[error("type URL is required for ADS")]
    MissingTypeUrl,

    /// A live watch dropped its emitter without responding.
    #[error("{type_url} watch failed")]
    WatchFailed { type_url: String },

    /// The client went away; nothing more can be written.
    #[error("client disconnected")]
    Disconnected,
}

impl StreamError {
    /// The status to fail the stream with, if one can still be delivered.
    pub fn to_status(&self) -> Option<Status> {
        match self {
            StreamError::MissingTypeUrl => Some(Status::unknown(self.to_string())),
            StreamError::WatchFailed { .. } => Some(Status::unavailable(self.to_string())),
            StreamError::Disconnected => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn protocol_violations_map_to_unknown() {
        let status = StreamError::MissingTypeUrl.to_status().unwrap();
        assert_eq!(status.code(), Code::Unknown);
        assert_eq!(status.message(), "type URL is required for ADS");
    }

    #[test]
    fn watch_failures_map_to_unavailable() {
        let status = StreamError::WatchFailed {
            type_url: "type.googleapis.com/envoy.config.cluster.v3.Cluster".to_string(),
        }
        .to_status()
        .unwrap();
        assert_eq!(status.code(), Code::Unavailable);
    }

    #[test]
    fn disconnects_carry_no_status() {
        assert!(StreamError::Disconnected.to_status().is_none());
    }
}
