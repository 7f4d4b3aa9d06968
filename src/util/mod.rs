pub mod buf_ext;
pub mod listeners;
pub mod safe_converter;
