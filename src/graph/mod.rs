pub mod edge;
pub mod vertex;

pub use edge::{Edge, EdgeData, EdgeRef};
pub use vertex::{EdgeEntry, Vertex, VertexData};
