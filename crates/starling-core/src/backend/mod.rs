//! Transport backend abstraction.
//!
//! The core demands little of its transport: FIFO per sender, uniform
//! total order inside a primary configuration, and view-change
//! notifications delivered inline with the message stream. Everything
//! else (sockets, TLS, the membership consensus) lives behind this seam.
//!
//! Backends are addressed by URL, `scheme://address`. The `dummy` scheme
//! is the in-process hub used by tests and single-process deployments;
//! `spread` and `gcomm` name external drivers this build does not carry.

pub mod dummy;

use bytes::Bytes;
use starling_types::{MemberId, NodeId};

use crate::config::GcsConfig;
use crate::error::{CoreError, CoreResult};
use crate::group::ViewInfo;

/// An event delivered by the transport, in total order.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    /// One wire frame from a member (possibly ourselves).
    Message { sender: NodeId, frame: Bytes },

    /// The membership changed.
    View(ViewInfo),

    /// The transport shut down; no further events follow.
    Shutdown,
}

/// A connected transport endpoint.
pub trait Backend: Send + Sync {
    /// Our transport-assigned identity within the channel.
    fn node_id(&self) -> NodeId;

    /// Broadcasts one frame to the group, ourselves included.
    fn send(&self, frame: Bytes) -> CoreResult<()>;

    /// Blocks for the next event. Returns [`BackendEvent::Shutdown`]
    /// after [`Backend::close`].
    fn recv(&self) -> BackendEvent;

    /// Leaves the channel and unblocks the receiver.
    fn close(&self);
}

/// Parsed backend URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendUrl {
    /// URL scheme: `dummy`, `spread` or `gcomm`.
    pub scheme: String,

    /// Scheme-specific address; namespaces dummy hubs.
    pub address: String,
}

impl BackendUrl {
    /// Parses `scheme://address`, validating the scheme.
    pub fn parse(url: &str) -> CoreResult<Self> {
        let (scheme, address) = url
            .split_once("://")
            .ok_or_else(|| CoreError::Config(format!("backend url `{url}` has no scheme")))?;
        match scheme {
            "dummy" | "spread" | "gcomm" => Ok(Self {
                scheme: scheme.to_string(),
                address: address.to_string(),
            }),
            other => Err(CoreError::Config(format!(
                "unknown backend scheme `{other}`"
            ))),
        }
    }
}

/// Connects to the channel named by `channel` through the backend `url`.
pub fn connect(
    url: &BackendUrl,
    channel: &str,
    name: &MemberId,
    _config: &GcsConfig,
) -> CoreResult<Box<dyn Backend>> {
    match url.scheme.as_str() {
        "dummy" => Ok(Box::new(dummy::DummyBackend::connect(
            &url.address,
            channel,
            name,
        ))),
        scheme => Err(CoreError::Backend(format!(
            "backend scheme `{scheme}` requires an external driver"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_known_schemes() {
        for scheme in ["dummy", "spread", "gcomm"] {
            let url = BackendUrl::parse(&format!("{scheme}://somewhere")).expect("parse");
            assert_eq!(url.scheme, scheme);
            assert_eq!(url.address, "somewhere");
        }
    }

    #[test]
    fn parse_accepts_empty_address() {
        let url = BackendUrl::parse("dummy://").expect("parse");
        assert_eq!(url.address, "");
    }

    #[test]
    fn parse_rejects_unknown_scheme() {
        assert!(matches!(
            BackendUrl::parse("carrier-pigeon://loft"),
            Err(CoreError::Config(_))
        ));
    }

    #[test]
    fn parse_rejects_missing_scheme() {
        assert!(matches!(
            BackendUrl::parse("just-a-host"),
            Err(CoreError::Config(_))
        ));
    }

    #[test]
    fn connect_rejects_external_schemes() {
        let url = BackendUrl::parse("gcomm://10.0.0.1").expect("parse");
        let result = connect(
            &url,
            "channel",
            &MemberId::new("n1"),
            &GcsConfig::default(),
        );
        assert!(matches!(result, Err(CoreError::Backend(_))));
    }
}
