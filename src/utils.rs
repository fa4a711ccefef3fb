use indicatif::{ProgressBar, ProgressStyle};

pub fn create_progress_bar(quiet: bool, len: usize) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let progress = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::with_template("{bar:40} {pos}/{len} accounts") {
        progress.set_style(style);
    }
    progress
}
