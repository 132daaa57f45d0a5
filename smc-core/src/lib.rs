//! core functionality for unpacking and repacking
//! obfuscated game script files
//!
//! # Modules
//!
//! - `rotor`: multi-rotor stream cipher and its key schedule
//! - `marshal`: tagged binary codec for script object graphs
//! - `redirect`: outer framing (mask, compress, encrypt) of whole files
//! - `error`: error kinds shared by all of the above

pub mod error;
pub mod marshal;
pub mod redirect;
pub mod rotor;

// Re-export commonly used items
pub use error::{Error, Result};
pub use marshal::{
    CodeObject, LongInt, OpcodeMap, Value, dump, dumps, load, loads, loads_prefix,
};
pub use redirect::{redirect, redirect_key, unredirect};
pub use rotor::{DEFAULT_ROTORS, RotorCipher};
