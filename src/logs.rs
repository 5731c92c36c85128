//! Bounded log tailing for the diagnoser and the device-access conflict pass.
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

/// Returns the last `lines` lines of the file at `path`.
///
/// # Returns
/// * `Ok(lines)` with at most `lines` entries, oldest first.
/// * `Err(_)` when the file is missing or unreadable (e.g. root-owned log).
pub fn tail_lines(path: &Path, lines: usize) -> io::Result<Vec<String>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut buffer: VecDeque<String> = VecDeque::with_capacity(lines);

    if lines == 0 {
        return Ok(Vec::new());
    }

    for line in reader.lines().map_while(Result::ok) {
        if buffer.len() == lines {
            buffer.pop_front();
        }
        buffer.push_back(line);
    }

    Ok(buffer.into_iter().collect())
}
