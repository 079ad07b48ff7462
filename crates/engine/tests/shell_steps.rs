#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use flowci_engine::{AgentContext, create_executor};
use flowci_types::{LogItem, LogKind, StepIn, StepResult, StepStatus, exit_code};
use tokio::sync::mpsc;

fn context(dir: &tempfile::TempDir) -> Arc<AgentContext> {
    let context = Arc::new(AgentContext::new("agent-test", dir.path()));
    context.ensure_dirs().expect("create agent dirs");
    context
}

async fn run(step: StepIn) -> (StepResult, Vec<LogItem>) {
    let dir = tempfile::tempdir().unwrap();
    run_in(&dir, step).await
}

/// Runs `step` with `dir` as workspace and collects the live log while it runs.
async fn run_in(dir: &tempfile::TempDir, step: StepIn) -> (StepResult, Vec<LogItem>) {
    let (sink, mut items) = mpsc::channel(64);
    let collector = tokio::spawn(async move {
        let mut lines = Vec::new();
        while let Some(item) = items.recv().await {
            lines.push(item);
        }
        lines
    });
    let executor = create_executor(step, context(dir), Some(sink)).await.expect("create executor");
    executor.init().await.expect("init");
    let result = executor.start().await;
    drop(executor);
    (result, collector.await.unwrap())
}

fn elapsed(result: &StepResult) -> Duration {
    result.duration().expect("start and finish recorded").to_std().expect("finish after start")
}

#[tokio::test]
async fn happy_path_streams_numbered_lines() {
    let mut step = StepIn::new("happy", vec!["echo bbb".into(), "echo aaa".into()]);
    step.timeout_seconds = 10;

    let (result, lines) = run(step).await;
    assert_eq!(result.status, StepStatus::Success);
    assert_eq!(result.code, exit_code::SUCCESS);
    assert_eq!(result.log_size, 2);
    let texts: Vec<_> = lines.iter().map(|item| (item.line_number, item.text())).collect();
    assert_eq!(texts, vec![(1, "bbb".to_string()), (2, "aaa".to_string())]);
}

#[tokio::test]
async fn exported_variables_are_filtered_by_prefix() {
    let mut step = StepIn::new("env", vec!["export FLOW_VVV=flowci".into(), "export FLOW_AAA=flow...".into()]);
    step.env_filters = vec!["FLOW_".into()];

    let (result, _) = run(step).await;
    assert_eq!(result.status, StepStatus::Success);
    assert_eq!(result.output.len(), 2, "{:?}", result.output);
    assert_eq!(result.output.get("FLOW_VVV"), Some("flowci"));
    assert_eq!(result.output.get("FLOW_AAA"), Some("flow..."));
}

#[tokio::test]
async fn deadline_ends_step_with_timeout() {
    let mut step = StepIn::new("slow", vec!["sleep 9999".into()]);
    step.timeout_seconds = 1;

    let (result, _) = run(step).await;
    assert_eq!(result.status, StepStatus::Timeout);
    assert_eq!(result.code, exit_code::TIMEOUT);
    let took = elapsed(&result);
    assert!(took >= Duration::from_secs(1) && took <= Duration::from_secs(4), "took {took:?}");
}

#[tokio::test]
async fn kill_ends_step_with_killed() {
    let dir = tempfile::tempdir().unwrap();
    let mut step = StepIn::new("killed", vec!["sleep 9999".into()]);
    step.timeout_seconds = 18000;
    let executor = Arc::new(create_executor(step, context(&dir), None).await.unwrap());
    executor.init().await.unwrap();

    let killer = {
        let executor = executor.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            executor.kill();
        })
    };
    let result = executor.start().await;
    killer.await.unwrap();

    assert_eq!(result.status, StepStatus::Killed);
    assert_eq!(result.code, exit_code::KILLED);
    let took = elapsed(&result);
    assert!(took >= Duration::from_secs(5) && took <= Duration::from_secs(7), "took {took:?}");
}

#[tokio::test]
async fn unknown_command_is_an_exception() {
    let (result, _) = run(StepIn::new("missing", vec!["notCommand".into()])).await;
    assert_eq!(result.status, StepStatus::Exception);
    assert_eq!(result.code, exit_code::UNKNOWN_COMMAND);
}

#[tokio::test]
async fn log_file_lands_in_logging_dir() {
    let dir = tempfile::tempdir().unwrap();
    let context = context(&dir);
    let executor = create_executor(StepIn::new("persisted", vec!["echo saved".into()]), context.clone(), None).await.unwrap();
    executor.init().await.unwrap();
    let result = executor.start().await;

    assert_eq!(result.status, StepStatus::Success);
    let content = std::fs::read_to_string(context.logging_dir.join("persisted.log")).unwrap();
    assert!(content.contains("saved"), "{content}");
}

#[tokio::test]
async fn unterminated_last_line_keeps_exports() {
    let mut step = StepIn::new("printf", vec!["export FLOW_A=1".into(), "printf abc".into()]);
    step.env_filters = vec!["FLOW_".into()];

    let (result, lines) = run(step).await;
    assert_eq!(result.status, StepStatus::Success);
    assert_eq!(result.output.get("FLOW_A"), Some("1"));
    assert_eq!(result.log_size, 1);
    let texts: Vec<_> = lines.iter().map(LogItem::text).collect();
    assert_eq!(texts, vec!["abc".to_string()]);
}

#[tokio::test]
async fn interleaved_streams_share_one_line_counter() {
    let step = StepIn::new(
        "interleaved",
        vec!["for i in $(seq 1 50); do echo out$i; echo err$i >&2; done".into()],
    );

    let (result, lines) = run(step).await;
    assert_eq!(result.status, StepStatus::Success);
    assert_eq!(result.log_size, 100);
    let numbers: Vec<u64> = lines.iter().map(|item| item.line_number).collect();
    assert_eq!(numbers, (1..=100).collect::<Vec<u64>>());
    assert_eq!(lines.iter().filter(|item| item.kind == LogKind::Err).count(), 50);
}

const COUNT_ATTEMPTS: &str = "n=$(cat attempts 2>/dev/null || echo 0); n=$((n+1)); echo $n > attempts";

fn attempts(dir: &tempfile::TempDir, step_flow: &str) -> u32 {
    let path = dir.path().join(step_flow).join("attempts");
    std::fs::read_to_string(path).unwrap().trim().parse().unwrap()
}

#[tokio::test]
async fn retries_stop_at_first_success() {
    let dir = tempfile::tempdir().unwrap();
    let mut step = StepIn::new("flaky", vec![COUNT_ATTEMPTS.into(), "[ $n -ge 3 ]".into()]);
    step.flow_id = "retry-flow".into();
    step.retry = 5;

    let (result, _) = run_in(&dir, step).await;
    assert_eq!(result.status, StepStatus::Success);
    assert_eq!(result.code, exit_code::SUCCESS);
    assert_eq!(attempts(&dir, "retry-flow"), 3);
}

#[tokio::test]
async fn retries_are_bounded_by_the_budget() {
    let dir = tempfile::tempdir().unwrap();
    let mut step = StepIn::new("failing", vec![COUNT_ATTEMPTS.into(), "exit 3".into()]);
    step.flow_id = "retry-flow".into();
    step.retry = 2;

    let (result, _) = run_in(&dir, step).await;
    assert_eq!(result.status, StepStatus::Exception);
    assert_eq!(result.code, 3);
    assert_eq!(attempts(&dir, "retry-flow"), 3);
}

/// Whether `pid` exists and is not a zombie waiting to be reaped.
fn is_running(pid: nix::unistd::Pid) -> bool {
    if nix::sys::signal::kill(pid, None).is_err() {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat.rsplit_once(')').map_or(true, |(_, rest)| !rest.trim_start().starts_with('Z')),
        Err(_) => true,
    }
}

#[tokio::test]
async fn kill_takes_down_the_whole_process_group() {
    use nix::unistd::Pid;

    let dir = tempfile::tempdir().unwrap();
    let mut step = StepIn::new("group", vec!["sleep 9999 &".into(), "echo $! > child.pid".into(), "wait".into()]);
    step.flow_id = "group-flow".into();
    let executor = Arc::new(create_executor(step, context(&dir), None).await.unwrap());
    executor.init().await.unwrap();

    let pid_file = dir.path().join("group-flow").join("child.pid");
    let task = {
        let executor = executor.clone();
        tokio::spawn(async move { executor.start().await })
    };
    let child = loop {
        if let Some(pid) = std::fs::read_to_string(&pid_file).ok().and_then(|text| text.trim().parse::<i32>().ok()) {
            break Pid::from_raw(pid);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    assert!(is_running(child), "background child should be alive before the kill");

    executor.kill();
    let result = task.await.unwrap();
    assert_eq!(result.status, StepStatus::Killed);
    assert_eq!(result.code, exit_code::KILLED);

    let mut alive = true;
    for _ in 0..40 {
        if !is_running(child) {
            alive = false;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!alive, "background child survived the kill");
}
