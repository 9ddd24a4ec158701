#![warn(missing_docs)]

//! agentmesh cluster subsystem: agent ownership directory, request routing,
//! agent rebalancing between management nodes and the periodic scanners.

pub mod attache;
pub mod config;
pub mod directory;
pub mod error;
pub mod lifecycle;
pub mod loader;
pub mod lock;
pub mod manager;
pub mod membership;
pub mod nodes;
pub mod planner;
pub mod rebalance;
pub mod router;
pub mod rpc;
pub mod scanner;
pub mod scheduler;
pub mod store;
pub mod types;

pub use attache::{AgentAttache, AgentChannel, AttacheKind, PeerRouting};
pub use config::{ClusterConfig, TlsPaths};
pub use directory::OwnershipDirectory;
pub use error::{AgentError, AgentResult, RebalanceError, StoreError, StoreResult};
pub use lifecycle::{AgentLifecycle, ClusterRoute};
pub use loader::{AnswerSink, HostLoader, LinkChannel, LoadedAgent, SimulatedHostLoader};
pub use lock::{ClusterLock, LocalLockService, LockLease};
pub use manager::{build_transport, ClusterAgentManager, ClusterServices};
pub use membership::{MembershipEvent, MembershipHandler};
pub use nodes::{DirectoryResolver, MemoryNodeDirectory, NodeDirectory};
pub use planner::{average_load, ClusterBasedPlanner, LoadBalancerPlanner, StaticPlanner};
pub use rebalance::{RebalanceCoordinator, TransferScanReport};
pub use router::{FrameSource, GenericDispatch, RequestRouter, RouteOutcome, UnhandledDispatch};
pub use rpc::{ClusterCommandHandler, LoopbackCluster, LoopbackEndpoint, PeerRpc};
pub use scanner::{DirectHostScanner, DirectScanReport, TransferScanner};
pub use scheduler::{Scheduler, TaskLock};
pub use store::{HostStore, MemoryRecordStore, RecordMutation, RecordStore, TransferStore};
pub use types::{
    Clock, HostRecord, HostStatus, ManualClock, NodeRecord, NodeState, SystemClock, Timestamp, TransferRecord,
    TransferState,
};
