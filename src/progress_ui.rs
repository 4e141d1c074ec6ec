//! Progress bar for `segfetch run`, fed by the coordinator's snapshot channel.

use std::sync::Arc;
use std::time::Duration;

use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use segfetch_core::ProgressSnapshot;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Spawns the bar when `enabled`; the task ends when `stop` fires or the channel closes.
///
/// When disabled the receiver is dropped, which unregisters the observer on
/// the next tick.
pub(crate) fn spawn_progress_ui(
    enabled: bool,
    rx: mpsc::Receiver<Arc<ProgressSnapshot>>,
    stop: CancellationToken,
) -> Option<JoinHandle<()>> {
    if !enabled {
        return None;
    }
    Some(tokio::spawn(render(rx, stop)))
}

async fn render(mut rx: mpsc::Receiver<Arc<ProgressSnapshot>>, stop: CancellationToken) {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{bar:30}] {bytes}/{total_bytes} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    bar.enable_steady_tick(Duration::from_millis(100));

    loop {
        let snapshot = tokio::select! {
            biased;
            () = stop.cancelled() => break,
            next = rx.recv() => match next {
                Some(snapshot) => snapshot,
                None => break,
            },
        };
        bar.set_length(known_total(&snapshot));
        bar.set_position(snapshot.total_bytes_written);
        bar.set_message(status_line(&snapshot));
    }

    bar.finish_and_clear();
}

/// Sum of the sizes known so far; open-ended downloads count what they wrote.
fn known_total(snapshot: &ProgressSnapshot) -> u64 {
    snapshot
        .downloads
        .iter()
        .map(|d| d.total_size_bytes.unwrap_or(d.bytes_written))
        .sum()
}

fn status_line(snapshot: &ProgressSnapshot) -> String {
    match snapshot.downloads.as_slice() {
        [] => "waiting".to_string(),
        [only] => format!(
            "{} {}/s ({}/{} segments)",
            only.display_name,
            HumanBytes(only.bytes_per_second),
            only.segments_done,
            only.segments_total
        ),
        many => format!(
            "{} downloads {}/s",
            many.len(),
            HumanBytes(snapshot.bytes_per_second)
        ),
    }
}
