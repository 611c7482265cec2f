use std::sync::LazyLock;

use indicatif::ProgressStyle;

/// Bar shown on the `evaluating` span.
pub(crate) static PROGRESS_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
});

/// One line per running task, no bar.
pub(crate) static TASK_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_spinner()
        .template("  {spinner:.blue} {msg} [{elapsed}]")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
});

/// Renders a panic payload caught from a task body or a blocking call.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown panic")
    }
}
