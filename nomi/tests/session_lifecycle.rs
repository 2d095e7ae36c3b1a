//! Session-level tests driving the turn loop with scripted collaborators.
//!
//! Each test scripts the model replies, the interpreter exit codes, and the
//! user's answers, then checks what the session printed, what it sent to the
//! model, and how it ended.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use nomi::cancel::is_cancelled;
use nomi::core::conversation::Conversation;
use nomi::core::types::{Os, Role};
use nomi::io::bridge::CompletionBridge;
use nomi::io::dispatch::Dispatcher;
use nomi::io::executor::ExecutorRegistry;
use nomi::io::process::ProcessLimits;
use nomi::session::{
    CONTINUE_LABEL, INPUT_PROMPT, STUCK_MESSAGE, Session, SessionOutcome, TurnState,
};
use nomi::test_support::{
    ScriptedCompletion, ScriptedInput, ScriptedLanguageExecutor, ScriptedProvider, ask_json,
    code_json,
};
use tokio_util::sync::CancellationToken;

struct Harness {
    provider: Arc<ScriptedProvider>,
    executor: ScriptedLanguageExecutor,
    bridge: CompletionBridge<ScriptedProvider>,
    dispatcher: Dispatcher,
}

struct Finished {
    result: Result<SessionOutcome>,
    conversation: Conversation,
    output: String,
    state: TurnState,
    failures: u32,
}

impl Harness {
    fn new(replies: Vec<ScriptedCompletion>, exit_codes: Vec<i32>) -> Self {
        Self::with_executor(replies, ScriptedLanguageExecutor::new(exit_codes))
    }

    fn with_executor(replies: Vec<ScriptedCompletion>, executor: ScriptedLanguageExecutor) -> Self {
        let provider = Arc::new(ScriptedProvider::new(replies));
        let mut registry = ExecutorRegistry::new();
        registry.register("bash", executor.clone(), None);
        let limits = ProcessLimits {
            timeout: Duration::from_secs(5),
            output_limit_bytes: 10_000,
        };
        let dispatcher = Dispatcher::new(Arc::new(registry), limits).with_os(Os::Linux);
        let bridge = CompletionBridge::new(Arc::clone(&provider), 4);
        Self {
            provider,
            executor,
            bridge,
            dispatcher,
        }
    }

    async fn run(&self, input: &mut ScriptedInput, cancel: &CancellationToken) -> Finished {
        let mut out = Vec::new();
        let (result, conversation, state, failures) = {
            let mut session = Session::new(
                &self.bridge,
                &self.dispatcher,
                input,
                &mut out,
                "system instructions".to_string(),
            );
            let result = session.run(cancel).await;
            (
                result,
                session.conversation().clone(),
                session.state(),
                session.consecutive_failures(),
            )
        };
        Finished {
            result,
            conversation,
            output: String::from_utf8(out).expect("utf8 output"),
            state,
            failures,
        }
    }

    fn last_message_of_request(&self, index: usize) -> (Role, String) {
        let requests = self.provider.requests();
        let last = requests[index].last().expect("non-empty request");
        (last.role, last.content.clone())
    }
}

fn roles(conversation: &Conversation) -> Vec<Role> {
    conversation.messages().iter().map(|m| m.role()).collect()
}

fn reports(conversation: &Conversation) -> usize {
    conversation
        .messages()
        .iter()
        .filter(|m| m.content().starts_with("Execution report:"))
        .count()
}

fn cancel_after(delay: Duration) -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        trigger.cancel();
    });
    cancel
}

#[tokio::test]
async fn ask_then_code_then_stop() {
    let harness = Harness::new(
        vec![
            ScriptedCompletion::reply(ask_json("Which directory?")),
            ScriptedCompletion::reply(code_json("bash", "ls ~")),
        ],
        vec![0],
    );
    let mut input = ScriptedInput::new(vec!["list my files", "home"], vec![false]);

    let finished = harness.run(&mut input, &CancellationToken::new()).await;

    let outcome = finished.result.expect("session ends cleanly");
    assert_eq!(
        outcome,
        SessionOutcome {
            completions: 2,
            executed_blocks: 1,
        }
    );
    assert!(finished.output.contains("Which directory?\n"));
    assert!(finished.output.contains("Received (0): ran: ls ~\n"));
    assert_eq!(input.prompts(), [INPUT_PROMPT, INPUT_PROMPT, CONTINUE_LABEL]);
    assert_eq!(
        roles(&finished.conversation),
        vec![
            Role::System,
            Role::User,
            Role::Assistant,
            Role::User,
            Role::Assistant,
            Role::Assistant,
        ]
    );
    assert_eq!(harness.executor.seen(), vec!["ls ~".to_string()]);
    assert_eq!(finished.state, TurnState::Terminated);
    assert_eq!(finished.failures, 0);
    assert_eq!(
        harness.last_message_of_request(1),
        (Role::User, "home".to_string())
    );
}

#[tokio::test]
async fn fourth_failure_hands_control_back_to_the_user() {
    let mut replies: Vec<ScriptedCompletion> = (0..4)
        .map(|_| ScriptedCompletion::reply(code_json("bash", "false")))
        .collect();
    replies.push(ScriptedCompletion::reply(code_json("bash", "true")));
    let harness = Harness::new(replies, vec![1, 1, 1, 1, 0]);
    let mut input = ScriptedInput::new(vec!["fix the build", "try cargo instead"], vec![false]);

    let finished = harness.run(&mut input, &CancellationToken::new()).await;

    let outcome = finished.result.expect("session ends cleanly");
    assert_eq!(outcome.completions, 5);
    assert_eq!(harness.provider.calls(), 5);
    assert_eq!(harness.executor.runs(), 5);
    assert_eq!(finished.output.matches(STUCK_MESSAGE).count(), 1);
    assert_eq!(finished.failures, 0);

    // The fourth request still follows a report; the fifth follows the user's redirect.
    let (role, content) = harness.last_message_of_request(3);
    assert_eq!(role, Role::Assistant);
    assert!(content.starts_with("Execution report: 0 of 1"));
    assert_eq!(
        harness.last_message_of_request(4),
        (Role::User, "try cargo instead".to_string())
    );
}

#[tokio::test]
async fn three_failures_then_success_never_asks_for_help() {
    let mut replies: Vec<ScriptedCompletion> = (0..3)
        .map(|_| ScriptedCompletion::reply(code_json("bash", "false")))
        .collect();
    replies.push(ScriptedCompletion::reply(code_json("bash", "true")));
    let harness = Harness::new(replies, vec![1, 1, 1, 0]);
    let mut input = ScriptedInput::new(vec!["fix the build"], vec![false]);

    let finished = harness.run(&mut input, &CancellationToken::new()).await;

    finished.result.expect("session ends cleanly");
    assert!(!finished.output.contains(STUCK_MESSAGE));
    assert_eq!(harness.provider.calls(), 4);
}

#[tokio::test]
async fn continuing_after_success_reads_a_new_instruction() {
    let harness = Harness::new(
        vec![
            ScriptedCompletion::reply(code_json("bash", "date")),
            ScriptedCompletion::reply(code_json("bash", "uptime")),
        ],
        vec![0, 0],
    );
    let mut input = ScriptedInput::new(vec!["what time is it", "and the uptime"], vec![true, false]);

    let finished = harness.run(&mut input, &CancellationToken::new()).await;

    let outcome = finished.result.expect("session ends cleanly");
    assert_eq!(outcome.completions, 2);
    assert_eq!(
        harness.last_message_of_request(1),
        (Role::User, "and the uptime".to_string())
    );
    assert_eq!(input.remaining_lines(), 0);
}

#[tokio::test]
async fn reply_without_code_blocks_is_not_a_failure() {
    let harness = Harness::new(
        vec![
            ScriptedCompletion::reply(code_json("bash", "")),
            ScriptedCompletion::reply(code_json("bash", "echo ok")),
        ],
        vec![0],
    );
    let mut input = ScriptedInput::new(vec!["say ok"], vec![false]);

    let finished = harness.run(&mut input, &CancellationToken::new()).await;

    let outcome = finished.result.expect("session ends cleanly");
    assert_eq!(outcome.completions, 2);
    assert_eq!(outcome.executed_blocks, 1);
    assert_eq!(harness.executor.runs(), 1);
    assert!(!finished.output.contains("Received (0): ran: \n"));
}

#[tokio::test]
async fn any_successful_block_counts_as_success() {
    let script = "```bash\nfalse\n```\n```python\nprint(1)\n```\n```bash\ntrue\n```";
    let harness = Harness::new(
        vec![ScriptedCompletion::reply(code_json("bash", script))],
        vec![1, 0],
    );
    let mut input = ScriptedInput::new(vec!["check"], vec![false]);

    let finished = harness.run(&mut input, &CancellationToken::new()).await;

    let outcome = finished.result.expect("session ends cleanly");
    assert_eq!(outcome.executed_blocks, 2);
    assert_eq!(harness.executor.seen(), vec!["false", "true"]);
    let failed = finished.output.find("Received (1)").expect("first result");
    let passed = finished.output.find("Received (0)").expect("second result");
    assert!(failed < passed);

    let report = finished
        .conversation
        .messages()
        .last()
        .expect("report")
        .content()
        .to_string();
    assert!(report.starts_with("Execution report: 1 of 2 block(s) succeeded."));
}

#[tokio::test]
async fn unsupported_language_is_reported_back_to_the_model() {
    let harness = Harness::new(
        vec![
            ScriptedCompletion::reply(code_json("cobol", "DISPLAY 'HI'")),
            ScriptedCompletion::reply(code_json("bash", "echo hi")),
        ],
        vec![0],
    );
    let mut input = ScriptedInput::new(vec!["greet me"], vec![false]);

    let finished = harness.run(&mut input, &CancellationToken::new()).await;

    finished.result.expect("session ends cleanly");
    assert!(
        finished
            .output
            .contains("Received (1): \nunsupported language: cobol")
    );
    assert_eq!(harness.executor.runs(), 1);
    let (role, content) = harness.last_message_of_request(1);
    assert_eq!(role, Role::Assistant);
    assert!(content.contains("unsupported language: cobol"));
}

#[tokio::test]
async fn malformed_decision_is_fatal() {
    let harness = Harness::new(vec![ScriptedCompletion::reply("sure, here you go")], vec![]);
    let mut input = ScriptedInput::new(vec!["do something"], vec![]);

    let finished = harness.run(&mut input, &CancellationToken::new()).await;

    let err = finished.result.unwrap_err();
    assert!(!is_cancelled(&err));
    assert!(format!("{err:#}").contains("parse model decision"));
    assert_eq!(harness.executor.runs(), 0);
    assert_eq!(finished.state, TurnState::Deciding);
}

#[tokio::test]
async fn provider_failure_is_fatal() {
    let harness = Harness::new(
        vec![ScriptedCompletion::Fail("connection refused".to_string())],
        vec![],
    );
    let mut input = ScriptedInput::new(vec!["do something"], vec![]);

    let finished = harness.run(&mut input, &CancellationToken::new()).await;

    let err = finished.result.unwrap_err();
    assert!(!is_cancelled(&err));
    assert!(format!("{err:#}").contains("connection refused"));
}

#[tokio::test]
async fn cancellation_during_completion_leaves_no_stale_reply() {
    let harness = Harness::new(vec![ScriptedCompletion::Hang], vec![]);
    let mut input = ScriptedInput::new(vec!["think hard"], vec![]);
    let cancel = cancel_after(Duration::from_millis(50));

    let finished = tokio::time::timeout(Duration::from_secs(5), harness.run(&mut input, &cancel))
        .await
        .expect("session stopped before timeout");

    let err = finished.result.unwrap_err();
    assert!(is_cancelled(&err));
    assert_eq!(roles(&finished.conversation), vec![Role::System, Role::User]);
    assert!(finished.output.is_empty());
    assert_eq!(finished.state, TurnState::AwaitingCompletion);
}

#[tokio::test]
async fn cancellation_while_waiting_for_input_ends_the_session() {
    let harness = Harness::new(
        vec![ScriptedCompletion::reply(ask_json("Which directory?"))],
        vec![],
    );
    let mut input = ScriptedInput::new(vec!["list my files"], vec![]).waiting_when_exhausted();
    let cancel = cancel_after(Duration::from_millis(50));

    let finished = tokio::time::timeout(Duration::from_secs(5), harness.run(&mut input, &cancel))
        .await
        .expect("session stopped before timeout");

    assert!(is_cancelled(&finished.result.unwrap_err()));
    assert!(finished.output.contains("Which directory?"));
    assert!(!finished.output.contains("Received ("));
    assert_eq!(reports(&finished.conversation), 0);
    assert_eq!(
        roles(&finished.conversation),
        vec![Role::System, Role::User, Role::Assistant]
    );
    assert_eq!(finished.state, TurnState::AwaitingUserInput);
    assert_eq!(harness.provider.calls(), 1);
}

#[tokio::test]
async fn cancellation_during_execution_discards_the_run() {
    let harness = Harness::with_executor(
        vec![ScriptedCompletion::reply(code_json("bash", "sleep 600"))],
        ScriptedLanguageExecutor::blocking_until_cancelled(),
    );
    let mut input = ScriptedInput::new(vec!["wait ten minutes"], vec![false]);
    let cancel = cancel_after(Duration::from_millis(50));

    let finished = tokio::time::timeout(Duration::from_secs(5), harness.run(&mut input, &cancel))
        .await
        .expect("session stopped before timeout");

    assert!(is_cancelled(&finished.result.unwrap_err()));
    assert!(!finished.output.contains("Received ("));
    assert_eq!(reports(&finished.conversation), 0);
    assert_eq!(finished.state, TurnState::ExecutingCode);
    assert_eq!(finished.failures, 0);
    assert_eq!(harness.executor.runs(), 1);
}

#[tokio::test]
async fn cancellation_before_first_input_skips_the_model() {
    let harness = Harness::new(vec![ScriptedCompletion::reply(ask_json("?"))], vec![]);
    let mut input = ScriptedInput::new(vec!["never read"], vec![]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let finished = harness.run(&mut input, &cancel).await;

    assert!(is_cancelled(&finished.result.unwrap_err()));
    assert_eq!(harness.provider.calls(), 0);
    assert_eq!(input.remaining_lines(), 1);
}
