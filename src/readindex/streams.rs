//! Names of system streams and system event types.

/// Helpers for metastream naming. The metastream of `orders` is `$$orders`.
pub struct SystemStreams;

impl SystemStreams {
    pub const METASTREAM_PREFIX: &'static str = "$$";

    pub fn metastream_of(stream: &str) -> String {
        format!("{}{}", Self::METASTREAM_PREFIX, stream)
    }

    pub fn is_metastream(stream: &str) -> bool {
        stream.starts_with(Self::METASTREAM_PREFIX)
    }

    /// The stream a metastream describes, `None` for ordinary streams
    pub fn original_stream_of(metastream: &str) -> Option<&str> {
        metastream.strip_prefix(Self::METASTREAM_PREFIX)
    }

    pub fn is_system_stream(stream: &str) -> bool {
        stream.starts_with('$')
    }
}

pub mod event_types {
    pub const STREAM_METADATA: &str = "$metadata";
    pub const STREAM_DELETED: &str = "$streamDeleted";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metastream_names() {
        let meta = SystemStreams::metastream_of("orders");
        assert_eq!(meta, "$$orders");
        assert!(SystemStreams::is_metastream(&meta));
        assert!(SystemStreams::is_system_stream(&meta));
        assert_eq!(SystemStreams::original_stream_of(&meta), Some("orders"));
        assert!(!SystemStreams::is_metastream("orders"));
        assert_eq!(SystemStreams::original_stream_of("orders"), None);
    }
}
