pub mod fs;
pub mod str;
pub mod time;
