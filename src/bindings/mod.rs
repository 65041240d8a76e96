//! Host-language surfaces over the bridge

pub mod python;
