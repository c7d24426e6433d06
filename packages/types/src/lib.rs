mod descriptor;
mod id;
mod payload;
mod response;
mod tokens;
pub use descriptor::*;
pub use id::*;
pub use payload::*;
pub use response::*;
pub use tokens::*;
