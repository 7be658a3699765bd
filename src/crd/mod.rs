//! Custom Resource Definitions for luapolicy.
//!
//! - `LuaPolicy`: a user-authored policy (script + match criteria)
//! - `LuaPolicyBundle`: the compiled, compressed script payload
//! - `LuaPolicyViolations`: bounded ring of recent denials

mod bundle;
mod policy;
mod violations;

pub use bundle::*;
pub use policy::*;
pub use violations::*;
