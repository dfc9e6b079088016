pub mod file;
pub mod time;

pub use file::{list_json_files, temp_path_for, write_atomic, FileEntry};
pub use time::{format_local, next_version_time, parse_version_id, version_id};
