//! Several OS processes contending for one shared window.
//!
//! The parent test re-executes this test binary; the environment variable
//! below switches the child into its worker role.

use std::process::Command;
use std::process::Stdio;
use std::time::Duration;

use pace_limit::CrossProcessCoordinator;
use pace_limit::Limiter;
use pace_limit::WindowConfig;

const STATE_ENV: &str = "PACE_LIMIT_SHARED_STATE";
const CHILDREN: usize = 4;
const ATTEMPTS_PER_CHILD: usize = 15;
const LIMIT: u32 = 25;

fn coordinator(path: &str) -> CrossProcessCoordinator {
    CrossProcessCoordinator::new(
        WindowConfig::new(LIMIT, Duration::from_secs(60), path)
            .with_poll_interval(Duration::from_millis(1)),
    )
    .unwrap()
}

#[test]
#[ignore = "worker half of processes_never_exceed_the_shared_limit"]
fn contend_for_shared_window() {
    let Ok(path) = std::env::var(STATE_ENV) else {
        return;
    };
    let coordinator = coordinator(&path);
    let granted = (0..ATTEMPTS_PER_CHILD)
        .filter(|_| {
            coordinator
                .acquire(1, Some(Duration::ZERO))
                .unwrap()
                .is_granted()
        })
        .count();
    println!("granted={granted}");
}

fn parse_granted(stdout: &[u8]) -> usize {
    let text = String::from_utf8_lossy(stdout);
    let tail = text
        .split("granted=")
        .nth(1)
        .unwrap_or_else(|| panic!("no grant count in child output: {text}"));
    tail.chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .unwrap()
}

#[test]
fn processes_never_exceed_the_shared_limit() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("shared.json");
    let exe = std::env::current_exe().unwrap();

    let children: Vec<_> = (0..CHILDREN)
        .map(|_| {
            Command::new(&exe)
                .args([
                    "contend_for_shared_window",
                    "--exact",
                    "--ignored",
                    "--nocapture",
                    "--test-threads=1",
                ])
                .env(STATE_ENV, &state)
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .spawn()
                .unwrap()
        })
        .collect();

    let total: usize = children
        .into_iter()
        .map(|child| {
            let output = child.wait_with_output().unwrap();
            assert!(output.status.success(), "child failed: {output:?}");
            parse_granted(&output.stdout)
        })
        .sum();

    // 60 attempts against a budget of 25 within one window.
    assert_eq!(total, LIMIT as usize);

    let observer = coordinator(state.to_str().unwrap());
    let status = observer.get_status();
    assert_eq!(status.current_count, u64::from(LIMIT));
    assert_eq!(status.utilization_percent, 100.0);
    assert!(!observer.try_acquire(1).unwrap());
}
