pub mod sys;

use humansize::{DECIMAL, format_size};

pub fn format_file_size(size: u64) -> String {
    format_size(size, DECIMAL)
}
