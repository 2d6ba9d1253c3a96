//! Config push protocol: the RPC contract between the master and each
//! worker process.
//!
//! The master is the client; every worker serves this protocol on its own
//! Unix socket. Operations come in check/commit pairs: the master always
//! issues the `*_check` variant first and only commits once every targeted
//! worker has answered `SUCCESS` or `SKILL` — a two-phase pattern that
//! avoids worker-side rollback.
//!
//! # Wire format
//!
//! Requests and responses travel as 4-byte big-endian length-delimited
//! frames (see [`codec`]). A request frame is `[tag: u8][protobuf payload]`
//! where the tag selects the operation ([`MessageKind`]); a response frame
//! is the bare protobuf payload of the response type implied by the
//! request's tag.

pub mod codec;

pub use codec::{
    push_codec, recv_request, recv_response, send_request, send_response, PushError,
    MAX_PUSH_FRAME_SIZE,
};

/// Per-call status reported by a worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum StatusCode {
    /// The operation was validated or applied.
    Success = 0,
    /// The operation was rejected; the response message says why.
    Fail = 1,
    /// The worker does not own the targeted profession/driver. Not an
    /// error: excluded from failure aggregation.
    Skill = 2,
}

/// Operation selector carried as the first byte of a request frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Liveness probe; the response reports owned ports.
    Ping = 1,
    /// Dry-run validation of a configuration set.
    SetCheck = 2,
    /// Committing configuration set.
    Set = 3,
    /// Dry-run validation of a configuration removal.
    DeleteCheck = 4,
    /// Committing configuration removal.
    Delete = 5,
    /// Reconcile the worker's listener set to exactly the given ports.
    Refresh = 6,
}

impl MessageKind {
    /// Parses a wire tag, returning `None` for unknown tags.
    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Ping),
            2 => Some(Self::SetCheck),
            3 => Some(Self::Set),
            4 => Some(Self::DeleteCheck),
            5 => Some(Self::Delete),
            6 => Some(Self::Refresh),
            _ => None,
        }
    }

    /// The wire tag for this operation.
    #[must_use]
    pub const fn tag(self) -> u8 {
        self as u8
    }
}

/// Ports currently owned by a worker.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct WorkerResource {
    #[prost(uint32, repeated, tag = "1")]
    pub ports: Vec<u32>,
}

/// Liveness probe request.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct HelloRequest {
    /// Opaque echo payload; returned verbatim.
    #[prost(string, tag = "1")]
    pub hello: String,
}

/// Liveness probe response.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct HelloResponse {
    #[prost(string, tag = "1")]
    pub hello: String,
    /// The ports the worker currently owns, used to reconcile drift.
    #[prost(message, optional, tag = "2")]
    pub resource: Option<WorkerResource>,
}

/// Inputs for `set_check` and `set`.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct SetRequest {
    /// Configuration id, unique across the cluster.
    #[prost(string, tag = "1")]
    pub id: String,
    /// Profession the entry belongs to.
    #[prost(string, tag = "2")]
    pub profession: String,
    /// Entry name, unique within the profession.
    #[prost(string, tag = "3")]
    pub name: String,
    /// Driver that interprets the body.
    #[prost(string, tag = "4")]
    pub driver: String,
    /// Opaque configuration body.
    #[prost(bytes = "vec", tag = "5")]
    pub body: Vec<u8>,
}

/// Outcome of `set_check` or `set`.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct SetResponse {
    #[prost(int32, tag = "1")]
    pub status: i32,
    /// Human-readable rejection reason when `status` is `FAIL`.
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(message, optional, tag = "3")]
    pub resource: Option<WorkerResource>,
}

/// Inputs for `delete_check` and `delete`.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct DeleteRequest {
    /// Configuration id to remove.
    #[prost(string, tag = "1")]
    pub id: String,
}

/// Outcome of `delete_check` or `delete`.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct DeleteResponse {
    #[prost(int32, tag = "1")]
    pub status: i32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(message, optional, tag = "3")]
    pub resource: Option<WorkerResource>,
}

/// Desired listener port set for a worker.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct RefreshRequest {
    #[prost(uint32, repeated, tag = "1")]
    pub ports: Vec<u32>,
}

/// Outcome of `refresh`.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct RefreshResponse {
    #[prost(int32, tag = "1")]
    pub status: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

impl HelloResponse {
    /// Builds the echo response for a probe.
    #[must_use]
    pub fn echo(request: &HelloRequest, ports: Vec<u32>) -> Self {
        Self {
            hello: request.hello.clone(),
            resource: Some(WorkerResource { ports }),
        }
    }
}

impl SetResponse {
    /// A successful outcome reporting the worker's current ports.
    #[must_use]
    pub fn success(ports: Vec<u32>) -> Self {
        Self {
            status: StatusCode::Success as i32,
            message: String::new(),
            resource: Some(WorkerResource { ports }),
        }
    }

    /// A rejection with a reason. Prior configuration stays active.
    #[must_use]
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::Fail as i32,
            message: message.into(),
            resource: None,
        }
    }

    /// The worker does not own the targeted profession/driver.
    #[must_use]
    pub fn skill(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::Skill as i32,
            message: message.into(),
            resource: None,
        }
    }

    /// Decoded status; unknown codes read as failures.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        StatusCode::try_from(self.status).unwrap_or(StatusCode::Fail)
    }
}

impl DeleteResponse {
    /// A successful outcome reporting the worker's current ports.
    #[must_use]
    pub fn success(ports: Vec<u32>) -> Self {
        Self {
            status: StatusCode::Success as i32,
            message: String::new(),
            resource: Some(WorkerResource { ports }),
        }
    }

    /// A rejection with a reason.
    #[must_use]
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::Fail as i32,
            message: message.into(),
            resource: None,
        }
    }

    /// The worker does not own the targeted entry's profession.
    #[must_use]
    pub fn skill(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::Skill as i32,
            message: message.into(),
            resource: None,
        }
    }

    /// Decoded status; unknown codes read as failures.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        StatusCode::try_from(self.status).unwrap_or(StatusCode::Fail)
    }
}

impl RefreshResponse {
    /// A successful reconciliation.
    #[must_use]
    pub fn success() -> Self {
        Self {
            status: StatusCode::Success as i32,
            message: String::new(),
        }
    }

    /// A failed reconciliation with a reason.
    #[must_use]
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::Fail as i32,
            message: message.into(),
        }
    }

    /// Decoded status; unknown codes read as failures.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        StatusCode::try_from(self.status).unwrap_or(StatusCode::Fail)
    }
}
