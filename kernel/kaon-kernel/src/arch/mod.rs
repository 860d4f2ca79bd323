//! Architecture support. IA-32 is the only implemented target.

pub mod x86;
