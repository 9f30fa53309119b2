/// Human-readable binary size, e.g. `96.00 MiB`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

/// Compacts part numbers into runs: `[1, 2, 3, 4, 6]` becomes `1-4,6`.
///
/// Input order does not matter; duplicates are ignored.
pub fn collapse_runs(numbers: &[u32]) -> String {
    let mut sorted = numbers.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut runs: Vec<String> = Vec::new();
    let mut iter = sorted.into_iter();
    let Some(mut start) = iter.next() else {
        return String::new();
    };
    let mut prev = start;
    for n in iter {
        if n == prev + 1 {
            prev = n;
            continue;
        }
        runs.push(render_run(start, prev));
        start = n;
        prev = n;
    }
    runs.push(render_run(start, prev));
    runs.join(",")
}

fn render_run(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{start}-{end}")
    }
}
