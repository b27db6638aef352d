pub(crate) mod bits;
pub(crate) mod buffer;
pub mod bytes;
pub mod crc;
pub(crate) mod frame;
pub mod function;
pub(crate) mod phys;
