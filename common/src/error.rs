use thiserror::Error;

/// Errores del modelo de grafo y del particionado.
///
/// Todos son fatales para la invocación: indican un DAG corrupto o una
/// petición que no tiene sentido para el estado actual de la ejecución.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("nodo duplicado en el DAG: {0}")]
    DuplicateNode(String),

    #[error("la arista {source_node_id} -> {target_node_id} referencia un nodo inexistente")]
    UnknownEdgeEndpoint {
        source_node_id: String,
        target_node_id: String,
    },

    #[error("nodo desconocido: {0}")]
    UnknownNode(String),

    #[error("ningún nodo de la ejecución corresponde al run {0}")]
    RunNotFound(String),

    #[error("la lista de particiones está vacía")]
    EmptyPartitionList,
}
