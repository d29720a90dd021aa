// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Protobuf messages exchanged between controllers and workers.
//!
//! Field tags are part of the wire contract; never renumber them.

// ============================================================================
// Headers
// ============================================================================

/// Top-level request category.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum HeaderType {
    /// Data-plane operations queued in the worker processor.
    Queued = 0,
    /// Management of a previously queued request.
    Request = 1,
    /// Control of the worker service itself.
    Service = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum QueuedRequestType {
    TestEcho = 0,
    ReplicaCreate = 1,
    ReplicaDelete = 2,
    ReplicaFind = 3,
    ReplicaFindAll = 4,
    Index = 5,
    Sql = 6,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ManagementRequestType {
    RequestStatus = 0,
    RequestStop = 1,
    RequestTrack = 2,
    RequestDispose = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ServiceRequestType {
    ServiceSuspend = 0,
    ServiceResume = 1,
    ServiceStatus = 2,
    ServiceRequests = 3,
    ServiceDrain = 4,
    ServiceReconfig = 5,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestHeader {
    /// Globally unique request id.
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(enumeration = "HeaderType", tag = "2")]
    pub r#type: i32,
    #[prost(enumeration = "QueuedRequestType", tag = "3")]
    pub queued_type: i32,
    #[prost(enumeration = "ManagementRequestType", tag = "4")]
    pub management_type: i32,
    #[prost(enumeration = "ServiceRequestType", tag = "5")]
    pub service_type: i32,
    /// Seconds the controller is willing to wait; informational for the worker.
    #[prost(uint32, tag = "6")]
    pub timeout: u32,
    #[prost(int32, tag = "7")]
    pub priority: i32,
    /// Instance of the fabric the sender belongs to.
    #[prost(string, tag = "8")]
    pub instance_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResponseHeader {
    #[prost(string, tag = "1")]
    pub id: String,
}

// ============================================================================
// Status
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Status {
    Created = 0,
    Success = 1,
    Queued = 2,
    InProgress = 3,
    IsCancelling = 4,
    Bad = 5,
    Failed = 6,
    Cancelled = 7,
}

impl Status {
    /// True once the request can no longer change state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Success | Status::Bad | Status::Failed | Status::Cancelled
        )
    }
}

/// Fine-grained failure reason accompanying [`Status`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum StatusExt {
    None = 0,
    InvalidParam = 1,
    InvalidId = 2,
    FolderStat = 3,
    FolderCreate = 4,
    FileStat = 5,
    FileSize = 6,
    FolderRead = 7,
    FileRead = 8,
    FileRopen = 9,
    FileCreate = 10,
    FileOpen = 11,
    FileResize = 12,
    FileWrite = 13,
    FileCopy = 14,
    FileDelete = 15,
    FileRename = 16,
    FileExists = 17,
    SpaceReq = 18,
    NoFolder = 19,
    BadFileType = 20,
    NoSpace = 21,
    NoSuchFile = 22,
    MysqlError = 23,
    LargeResult = 24,
    NoSuchTable = 25,
    NotPartitionedTable = 26,
    NoSuchPartition = 27,
    Multiple = 28,
    OtherException = 29,
    ForeignInstance = 30,
    DuplicateKey = 31,
    CantDropKey = 32,
}

/// Request timeline in milliseconds since the UNIX epoch.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Performance {
    #[prost(uint64, tag = "1")]
    pub receive_time: u64,
    #[prost(uint64, tag = "2")]
    pub start_time: u64,
    #[prost(uint64, tag = "3")]
    pub finish_time: u64,
}

// ============================================================================
// Replicas
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ReplicaStatus {
    NotFound = 0,
    Corrupt = 1,
    Incomplete = 2,
    Complete = 3,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileInfo {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(uint64, tag = "2")]
    pub size: u64,
    /// Modification time in seconds since the UNIX epoch.
    #[prost(uint64, tag = "3")]
    pub mtime: u64,
    /// Hex checksum; empty when not computed.
    #[prost(string, tag = "4")]
    pub cs: String,
    #[prost(uint64, tag = "5")]
    pub begin_transfer_time: u64,
    #[prost(uint64, tag = "6")]
    pub end_transfer_time: u64,
    /// Size of the source file a replica was copied from.
    #[prost(uint64, tag = "7")]
    pub in_size: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReplicaInfo {
    #[prost(enumeration = "ReplicaStatus", tag = "1")]
    pub status: i32,
    #[prost(string, tag = "2")]
    pub worker: String,
    #[prost(string, tag = "3")]
    pub database: String,
    #[prost(uint32, tag = "4")]
    pub chunk: u32,
    #[prost(uint64, tag = "5")]
    pub verify_time: u64,
    #[prost(message, repeated, tag = "6")]
    pub file_info_many: Vec<FileInfo>,
}

// ============================================================================
// Queued requests
// ============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EchoRequest {
    #[prost(string, tag = "1")]
    pub data: String,
    /// Milliseconds to wait before answering.
    #[prost(uint64, tag = "2")]
    pub delay: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EchoResponse {
    #[prost(enumeration = "Status", tag = "1")]
    pub status: i32,
    #[prost(enumeration = "StatusExt", tag = "2")]
    pub status_ext: i32,
    #[prost(string, tag = "3")]
    pub error: String,
    #[prost(message, optional, tag = "4")]
    pub performance: Option<Performance>,
    #[prost(string, tag = "10")]
    pub data: String,
}

/// Copy a chunk of `database` from the `worker` named in the request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReplicateRequest {
    #[prost(string, tag = "1")]
    pub database: String,
    #[prost(uint32, tag = "2")]
    pub chunk: u32,
    /// Source worker.
    #[prost(string, tag = "3")]
    pub worker: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReplicateResponse {
    #[prost(enumeration = "Status", tag = "1")]
    pub status: i32,
    #[prost(enumeration = "StatusExt", tag = "2")]
    pub status_ext: i32,
    #[prost(string, tag = "3")]
    pub error: String,
    #[prost(message, optional, tag = "4")]
    pub performance: Option<Performance>,
    #[prost(message, optional, tag = "10")]
    pub replica_info: Option<ReplicaInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteRequest {
    #[prost(string, tag = "1")]
    pub database: String,
    #[prost(uint32, tag = "2")]
    pub chunk: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteResponse {
    #[prost(enumeration = "Status", tag = "1")]
    pub status: i32,
    #[prost(enumeration = "StatusExt", tag = "2")]
    pub status_ext: i32,
    #[prost(string, tag = "3")]
    pub error: String,
    #[prost(message, optional, tag = "4")]
    pub performance: Option<Performance>,
    #[prost(message, optional, tag = "10")]
    pub replica_info: Option<ReplicaInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FindRequest {
    #[prost(string, tag = "1")]
    pub database: String,
    #[prost(uint32, tag = "2")]
    pub chunk: u32,
    /// Compute file checksums (slow for large chunks).
    #[prost(bool, tag = "3")]
    pub compute_cs: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FindResponse {
    #[prost(enumeration = "Status", tag = "1")]
    pub status: i32,
    #[prost(enumeration = "StatusExt", tag = "2")]
    pub status_ext: i32,
    #[prost(string, tag = "3")]
    pub error: String,
    #[prost(message, optional, tag = "4")]
    pub performance: Option<Performance>,
    #[prost(message, optional, tag = "10")]
    pub replica_info: Option<ReplicaInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FindAllRequest {
    #[prost(string, tag = "1")]
    pub database: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FindAllResponse {
    #[prost(enumeration = "Status", tag = "1")]
    pub status: i32,
    #[prost(enumeration = "StatusExt", tag = "2")]
    pub status_ext: i32,
    #[prost(string, tag = "3")]
    pub error: String,
    #[prost(message, optional, tag = "4")]
    pub performance: Option<Performance>,
    #[prost(message, repeated, tag = "10")]
    pub replica_info_many: Vec<ReplicaInfo>,
}

/// Extract the secondary index contribution of one chunk of the director table.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IndexRequest {
    #[prost(string, tag = "1")]
    pub database: String,
    #[prost(uint32, tag = "2")]
    pub chunk: u32,
    /// Restrict the dump to rows of one super-transaction.
    #[prost(bool, tag = "3")]
    pub has_transactions: bool,
    #[prost(uint32, tag = "4")]
    pub transaction_id: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IndexResponse {
    #[prost(enumeration = "Status", tag = "1")]
    pub status: i32,
    #[prost(enumeration = "StatusExt", tag = "2")]
    pub status_ext: i32,
    #[prost(string, tag = "3")]
    pub error: String,
    #[prost(message, optional, tag = "4")]
    pub performance: Option<Performance>,
    /// Tab-separated dump of `(key, chunk, sub-chunk)` rows.
    #[prost(bytes = "vec", tag = "10")]
    pub data: Vec<u8>,
}

// ============================================================================
// SQL
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum SqlRequestType {
    Query = 0,
    CreateDatabase = 1,
    DropDatabase = 2,
    EnableDatabase = 3,
    DisableDatabase = 4,
    GrantAccess = 5,
    CreateTable = 6,
    DropTable = 7,
    RemoveTablePartitioning = 8,
    DropTablePartition = 9,
    GetTableIndex = 10,
    CreateTableIndex = 11,
    DropTableIndex = 12,
    AlterTables = 13,
    TableRowStats = 14,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum SqlIndexSpec {
    Default = 0,
    Unique = 1,
    Fulltext = 2,
    Spatial = 3,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SqlColumnDef {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub r#type: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SqlIndexColumn {
    #[prost(string, tag = "1")]
    pub name: String,
    /// Prefix length; 0 for the whole column.
    #[prost(uint32, tag = "2")]
    pub length: u32,
    #[prost(bool, tag = "3")]
    pub ascending: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SqlRequest {
    #[prost(enumeration = "SqlRequestType", tag = "1")]
    pub r#type: i32,
    #[prost(string, tag = "2")]
    pub query: String,
    #[prost(string, tag = "3")]
    pub user: String,
    #[prost(string, tag = "4")]
    pub password: String,
    /// Cap on the number of rows returned per result set; 0 is unlimited.
    #[prost(uint64, tag = "5")]
    pub max_rows: u64,
    #[prost(string, tag = "6")]
    pub database: String,
    #[prost(string, tag = "7")]
    pub table: String,
    #[prost(string, tag = "8")]
    pub engine: String,
    #[prost(string, tag = "9")]
    pub partition_by_column: String,
    #[prost(uint32, tag = "10")]
    pub transaction_id: u32,
    #[prost(message, repeated, tag = "11")]
    pub columns: Vec<SqlColumnDef>,
    #[prost(enumeration = "SqlIndexSpec", tag = "12")]
    pub index_spec: i32,
    #[prost(string, tag = "13")]
    pub index_name: String,
    #[prost(string, tag = "14")]
    pub index_comment: String,
    #[prost(message, repeated, tag = "15")]
    pub index_columns: Vec<SqlIndexColumn>,
    /// Apply the operation to every table of `tables`, one transaction each.
    #[prost(bool, tag = "16")]
    pub batch_mode: bool,
    #[prost(string, repeated, tag = "17")]
    pub tables: Vec<String>,
    #[prost(string, tag = "18")]
    pub charset_name: String,
    /// `ALTER TABLE` clause for [`SqlRequestType::AlterTables`].
    #[prost(string, tag = "19")]
    pub alter_spec: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SqlField {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub type_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SqlRow {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub cells: Vec<Vec<u8>>,
    #[prost(bool, repeated, tag = "2")]
    pub nulls: Vec<bool>,
}

/// Outcome of the operation against one target (a table in batch mode).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SqlResultSet {
    #[prost(string, tag = "1")]
    pub error: String,
    #[prost(enumeration = "StatusExt", tag = "2")]
    pub status_ext: i32,
    #[prost(bool, tag = "3")]
    pub has_result: bool,
    #[prost(message, repeated, tag = "4")]
    pub fields: Vec<SqlField>,
    #[prost(message, repeated, tag = "5")]
    pub rows: Vec<SqlRow>,
    /// Table (or database) the result set belongs to.
    #[prost(string, tag = "6")]
    pub scope: String,
    #[prost(string, tag = "7")]
    pub char_set_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SqlResponse {
    #[prost(enumeration = "Status", tag = "1")]
    pub status: i32,
    #[prost(enumeration = "StatusExt", tag = "2")]
    pub status_ext: i32,
    #[prost(string, tag = "3")]
    pub error: String,
    #[prost(message, optional, tag = "4")]
    pub performance: Option<Performance>,
    #[prost(message, repeated, tag = "10")]
    pub result_sets: Vec<SqlResultSet>,
}

// ============================================================================
// Management requests
// ============================================================================

/// Body of `REQUEST_STATUS`, `REQUEST_STOP` and `REQUEST_TRACK`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ManagementRequest {
    /// Id of the queued request being managed.
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(enumeration = "QueuedRequestType", tag = "2")]
    pub queued_type: i32,
}

/// Answer to `REQUEST_STATUS` and `REQUEST_STOP`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatusResponse {
    #[prost(enumeration = "Status", tag = "1")]
    pub status: i32,
    #[prost(enumeration = "StatusExt", tag = "2")]
    pub status_ext: i32,
    #[prost(string, tag = "3")]
    pub error: String,
    #[prost(message, optional, tag = "4")]
    pub performance: Option<Performance>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DisposeRequest {
    #[prost(string, repeated, tag = "1")]
    pub ids: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DisposedId {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(bool, tag = "2")]
    pub disposed: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DisposeResponse {
    #[prost(message, repeated, tag = "1")]
    pub ids: Vec<DisposedId>,
}

// ============================================================================
// Service requests
// ============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServiceRequest {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ServiceState {
    Running = 0,
    SuspendInProgress = 1,
    Suspended = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServiceRequestInfo {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(enumeration = "QueuedRequestType", tag = "2")]
    pub queued_type: i32,
    #[prost(int32, tag = "3")]
    pub priority: i32,
    #[prost(enumeration = "Status", tag = "4")]
    pub status: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServiceResponse {
    /// Outcome of the service operation itself.
    #[prost(enumeration = "Status", tag = "1")]
    pub status: i32,
    #[prost(enumeration = "StatusExt", tag = "2")]
    pub status_ext: i32,
    #[prost(enumeration = "ServiceState", tag = "3")]
    pub service_state: i32,
    #[prost(string, tag = "4")]
    pub technology: String,
    /// Milliseconds since the UNIX epoch.
    #[prost(uint64, tag = "5")]
    pub start_time: u64,
    #[prost(uint32, tag = "6")]
    pub num_new_requests: u32,
    #[prost(uint32, tag = "7")]
    pub num_in_progress_requests: u32,
    #[prost(uint32, tag = "8")]
    pub num_finished_requests: u32,
    /// Only populated by `SERVICE_REQUESTS`.
    #[prost(message, repeated, tag = "9")]
    pub new_requests: Vec<ServiceRequestInfo>,
    #[prost(message, repeated, tag = "10")]
    pub in_progress_requests: Vec<ServiceRequestInfo>,
    #[prost(message, repeated, tag = "11")]
    pub finished_requests: Vec<ServiceRequestInfo>,
    #[prost(string, tag = "12")]
    pub instance_id: String,
}

// ============================================================================
// Shared response shape
// ============================================================================

/// Common status fields of every queued-request response.
pub trait QueuedResponse: ::prost::Message + Default + Send + 'static {
    fn outcome(&self) -> (Status, StatusExt);
    fn set_outcome(&mut self, status: Status, status_ext: StatusExt, error: String);
    fn set_performance(&mut self, performance: Performance);
}

macro_rules! impl_queued_response {
    ($($ty:ty),* $(,)?) => {
        $(
            impl QueuedResponse for $ty {
                fn outcome(&self) -> (Status, StatusExt) {
                    (
                        Status::try_from(self.status).unwrap_or(Status::Bad),
                        StatusExt::try_from(self.status_ext).unwrap_or(StatusExt::None),
                    )
                }

                fn set_outcome(&mut self, status: Status, status_ext: StatusExt, error: String) {
                    self.status = status as i32;
                    self.status_ext = status_ext as i32;
                    self.error = error;
                }

                fn set_performance(&mut self, performance: Performance) {
                    self.performance = Some(performance);
                }
            }
        )*
    };
}

impl_queued_response!(
    EchoResponse,
    ReplicateResponse,
    DeleteResponse,
    FindResponse,
    FindAllResponse,
    IndexResponse,
    SqlResponse,
    StatusResponse,
);

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_enum_accessors() {
        let header = RequestHeader {
            id: "x".into(),
            r#type: HeaderType::Request as i32,
            management_type: ManagementRequestType::RequestTrack as i32,
            ..Default::default()
        };
        assert_eq!(header.r#type(), HeaderType::Request);
        assert_eq!(header.management_type(), ManagementRequestType::RequestTrack);
        assert_eq!(header.queued_type(), QueuedRequestType::TestEcho);
    }

    #[test]
    fn test_unknown_enum_value_falls_back() {
        let response = SqlResponse {
            status: 99,
            ..Default::default()
        };
        assert_eq!(response.outcome().0, Status::Bad);
    }

    #[test]
    fn test_terminal_states() {
        assert!(Status::Success.is_terminal());
        assert!(Status::Cancelled.is_terminal());
        assert!(!Status::Queued.is_terminal());
        assert!(!Status::IsCancelling.is_terminal());
    }

    #[test]
    fn test_set_outcome() {
        let mut response = IndexResponse::default();
        response.set_outcome(Status::Failed, StatusExt::FileRead, "boom".into());
        response.set_performance(Performance {
            receive_time: 1,
            start_time: 2,
            finish_time: 3,
        });
        let decoded = IndexResponse::decode(response.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.outcome(), (Status::Failed, StatusExt::FileRead));
        assert_eq!(decoded.error, "boom");
        assert_eq!(decoded.performance.unwrap().finish_time, 3);
    }
}
