pub mod api;
pub mod dag;
pub mod error;
pub mod execution;
pub mod graph;
pub mod partition;
pub mod periodic;
pub mod task;

pub use api::*;
pub use dag::*;
pub use error::GraphError;
pub use execution::*;
pub use graph::{
    build_graph, create_new_dag_json, get_ready_nodes, group_by_original, FailedNode, Graph,
    ReadyNodes,
};
pub use partition::{apply_partition_list, partition_ready_nodes, split_edges, PartitionOutcome};
pub use periodic::*;
pub use task::*;
