//! End-to-end tests of the chat session against a scripted endpoint.

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;

    use chatloop::chat::{ChatConfig, ChatSession, Flow, RoundOutcome, SessionState};
    use chatloop::{
        Error, PageFetcher, RawResponse, Renderer, Reply, RequestPayload, Result, Role, Transport,
        Turn, Usage,
    };

    #[derive(Clone, Default)]
    struct ScriptedTransport {
        responses: Arc<Mutex<VecDeque<Result<RawResponse>>>>,
        requests: Arc<Mutex<Vec<Bytes>>>,
        stall: Option<Duration>,
    }

    impl ScriptedTransport {
        fn with(responses: Vec<Result<RawResponse>>) -> Self {
            Self {
                responses: Arc::new(Mutex::new(responses.into())),
                ..Self::default()
            }
        }

        fn stalled(stall: Duration) -> Self {
            Self {
                stall: Some(stall),
                ..Self::default()
            }
        }

        fn push(&self, response: RawResponse) {
            self.responses.lock().unwrap().push_back(Ok(response));
        }

        fn requests(&self) -> Vec<RequestPayload> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|body| RequestPayload::from_bytes(body).unwrap())
                .collect()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn execute(&self, body: Bytes, _stream: bool) -> Result<RawResponse> {
            self.requests.lock().unwrap().push(body);
            if let Some(stall) = self.stall {
                tokio::time::sleep(stall).await;
            }
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(Error::connection("script exhausted", None)))
        }
    }

    struct StaticFetcher(Result<String>);

    #[async_trait]
    impl PageFetcher for StaticFetcher {
        async fn fetch(&self, _url: &str) -> Result<String> {
            self.0.clone()
        }
    }

    #[derive(Default)]
    struct CaptureRenderer {
        replies: Vec<Reply>,
        usage: Vec<Usage>,
        info: Vec<String>,
        notices: Vec<String>,
        errors: Vec<String>,
        interrupts: usize,
    }

    impl Renderer for CaptureRenderer {
        fn print_reply(&mut self, reply: &Reply) {
            self.replies.push(reply.clone());
        }
        fn print_usage(&mut self, usage: &Usage) {
            self.usage.push(*usage);
        }
        fn print_info(&mut self, info: &str) {
            self.info.push(info.to_string());
        }
        fn print_notice(&mut self, notice: &str) {
            self.notices.push(notice.to_string());
        }
        fn print_error(&mut self, error: &str) {
            self.errors.push(error.to_string());
        }
        fn print_interrupted(&mut self) {
            self.interrupts += 1;
        }
    }

    fn completion(text: &str) -> RawResponse {
        let body = serde_json::json!({
            "id": "chatcmpl-1",
            "model": "gpt-4-0613",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": text},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        });
        RawResponse::json(200, serde_json::to_vec(&body).unwrap())
    }

    fn bad_request() -> RawResponse {
        RawResponse::json(
            400,
            r#"{"error":{"message":"bad request","type":"invalid_request_error"}}"#,
        )
    }

    fn unavailable() -> RawResponse {
        RawResponse::json(
            503,
            r#"{"error":{"message":"overloaded","type":"server_error"}}"#,
        )
    }

    fn config() -> ChatConfig {
        ChatConfig::new().with_system_prompt(Some("You are terse.".to_string()))
    }

    fn roles(turns: &[Turn]) -> Vec<Role> {
        turns.iter().map(Turn::role).collect()
    }

    #[tokio::test]
    async fn reply_appends_one_assistant_turn() {
        let transport = ScriptedTransport::with(vec![Ok(completion("Hi there!"))]);
        let mut session = ChatSession::new(transport.clone(), config());
        let mut out = CaptureRenderer::default();

        assert_eq!(session.handle_line("Hello", &mut out).await, Flow::Continue);

        let turns = session.store().snapshot();
        assert_eq!(roles(turns), vec![Role::System, Role::User, Role::Assistant]);
        assert_eq!(turns[1].content(), "Hello");
        assert_eq!(turns[2].content(), "Hi there!");
        assert_eq!(out.replies.len(), 1);
        assert_eq!(out.replies[0].text, "Hi there!");
        assert_eq!(out.usage, vec![Usage::new(12, 3)]);
        assert_eq!(session.state(), SessionState::Idle);

        let stats = session.stats();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.total_usage.total_tokens, 15);
    }

    #[tokio::test]
    async fn each_request_carries_whole_history() {
        let transport =
            ScriptedTransport::with(vec![Ok(completion("one")), Ok(completion("two"))]);
        let mut session = ChatSession::new(transport.clone(), config());
        let mut out = CaptureRenderer::default();

        session.handle_line("first", &mut out).await;
        session.handle_line("second", &mut out).await;

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(
            roles(requests[1].messages()),
            vec![Role::System, Role::User, Role::Assistant, Role::User]
        );
        let contents: Vec<&str> = requests[1].messages().iter().map(Turn::content).collect();
        assert_eq!(contents, vec!["You are terse.", "first", "one", "second"]);
        assert_eq!(requests[1].model(), "gpt-4");
        assert_eq!(requests[1].temperature(), Some(0.2));
        assert_eq!(requests[1].top_p(), Some(0.1));
    }

    #[tokio::test]
    async fn content_reaches_the_wire_verbatim() {
        let tricky = r#"List files using *.py and say "done" \n 100%"#;
        let transport = ScriptedTransport::with(vec![Ok(completion("ok"))]);
        let mut session = ChatSession::new(transport.clone(), config());
        let mut out = CaptureRenderer::default();

        session.handle_line(tricky, &mut out).await;

        let requests = transport.requests();
        assert_eq!(requests[0].messages()[1].content(), tricky);
    }

    #[tokio::test]
    async fn fatal_failure_keeps_user_turn_for_retry() {
        let transport = ScriptedTransport::with(vec![Ok(bad_request()), Ok(completion("ok"))]);
        let mut session = ChatSession::new(transport.clone(), config());
        let mut out = CaptureRenderer::default();

        session.handle_line("question", &mut out).await;
        assert_eq!(out.errors.len(), 1);
        assert_eq!(
            roles(session.store().snapshot()),
            vec![Role::System, Role::User]
        );

        session.handle_line("/retry", &mut out).await;
        assert_eq!(
            roles(session.store().snapshot()),
            vec![Role::System, Role::User, Role::Assistant]
        );
        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0], requests[1]);
    }

    #[tokio::test]
    async fn identical_text_resends_pending_turn() {
        let transport = ScriptedTransport::with(vec![Ok(bad_request()), Ok(completion("ok"))]);
        let mut session = ChatSession::new(transport.clone(), config());
        let mut out = CaptureRenderer::default();

        session.handle_line("question", &mut out).await;
        assert_eq!(
            session.submit("question", &mut out).await,
            RoundOutcome::Replied
        );
        let turns = session.store().snapshot();
        assert_eq!(turns.len(), 3);
        assert_eq!(
            turns.iter().filter(|t| t.role() == Role::User).count(),
            1
        );
    }

    #[tokio::test]
    async fn different_text_refused_while_pending() {
        let transport = ScriptedTransport::with(vec![Ok(bad_request())]);
        let mut session = ChatSession::new(transport.clone(), config());
        let mut out = CaptureRenderer::default();

        session.handle_line("question", &mut out).await;
        assert_eq!(
            session.submit("another question", &mut out).await,
            RoundOutcome::Skipped
        );
        assert_eq!(transport.requests().len(), 1);
        assert_eq!(session.store().len(), 2);
        assert_eq!(out.notices.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_retried_within_round() {
        let transport = ScriptedTransport::with(vec![Ok(unavailable()), Ok(completion("ok"))]);
        let mut session = ChatSession::new(transport.clone(), config());
        let mut out = CaptureRenderer::default();

        assert_eq!(session.submit("hello", &mut out).await, RoundOutcome::Replied);
        assert_eq!(transport.requests().len(), 2);
        assert!(out.errors.is_empty());
        assert_eq!(session.stats().total_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_report_failure() {
        let transport = ScriptedTransport::with(vec![Ok(unavailable()), Ok(unavailable())]);
        let mut session = ChatSession::new(transport.clone(), config().with_max_retries(1));
        let mut out = CaptureRenderer::default();

        assert_eq!(session.submit("hello", &mut out).await, RoundOutcome::Failed);
        assert_eq!(transport.requests().len(), 2);
        assert_eq!(out.errors.len(), 1);
        assert!(out.errors[0].contains("/retry"));
        assert_eq!(session.store().len(), 2);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_waits_then_succeeds() {
        let limited = RawResponse::json(
            429,
            r#"{"error":{"message":"Rate limit reached","type":"requests","code":"rate_limit_exceeded"}}"#,
        )
        .with_retry_after(Duration::from_secs(2));
        let transport = ScriptedTransport::with(vec![Ok(limited), Ok(completion("ok"))]);
        let mut session = ChatSession::new(transport.clone(), config());
        let mut out = CaptureRenderer::default();

        let started = tokio::time::Instant::now();
        assert_eq!(session.submit("hello", &mut out).await, RoundOutcome::Replied);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_abandons_round() {
        let transport = ScriptedTransport::stalled(Duration::from_secs(30));
        transport.push(completion("too late"));
        let mut session = ChatSession::new(transport.clone(), config());
        let flag = session.interrupt_handle();
        let mut out = CaptureRenderer::default();

        let interrupter = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            flag.store(true, Ordering::Relaxed);
        });
        let outcome = session.submit("slow question", &mut out).await;
        interrupter.await.unwrap();

        assert_eq!(outcome, RoundOutcome::Interrupted);
        assert_eq!(out.interrupts, 1);
        assert!(out.replies.is_empty());
        assert_eq!(
            roles(session.store().snapshot()),
            vec![Role::System, Role::User]
        );
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn reset_starts_from_preamble() {
        let transport =
            ScriptedTransport::with(vec![Ok(completion("one")), Ok(completion("two"))]);
        let mut session = ChatSession::new(transport.clone(), config());
        let mut out = CaptureRenderer::default();

        session.handle_line("first", &mut out).await;
        session.handle_line("/reset", &mut out).await;
        assert_eq!(session.store().len(), 1);
        session.handle_line("fresh", &mut out).await;

        let requests = transport.requests();
        let contents: Vec<&str> = requests[1].messages().iter().map(Turn::content).collect();
        assert_eq!(contents, vec!["You are terse.", "fresh"]);
    }

    #[tokio::test]
    async fn parameter_changes_apply_to_next_request() {
        let transport = ScriptedTransport::with(vec![Ok(completion("ok"))]);
        let mut session = ChatSession::new(transport.clone(), config());
        let mut out = CaptureRenderer::default();

        session.handle_line("/model gpt-4o", &mut out).await;
        session.handle_line("/temperature clear", &mut out).await;
        session.handle_line("/max_tokens 64", &mut out).await;
        session.handle_line("hello", &mut out).await;

        let request = &transport.requests()[0];
        assert_eq!(request.model(), "gpt-4o");
        assert_eq!(request.temperature(), None);
        assert_eq!(request.max_tokens(), Some(64));
    }

    #[tokio::test]
    async fn truncation_noticed_once() {
        let transport = ScriptedTransport::with(vec![
            Ok(completion("bbbbbbbbbb")),
            Ok(completion("dddddddddd")),
            Ok(completion("ffffffffff")),
        ]);
        let config = ChatConfig::new()
            .with_system_prompt(None)
            .with_context_budget(Some(25));
        let mut session = ChatSession::new(transport.clone(), config);
        let mut out = CaptureRenderer::default();

        session.handle_line("aaaaaaaaaa", &mut out).await;
        session.handle_line("cccccccccc", &mut out).await;
        session.handle_line("eeeeeeeeee", &mut out).await;

        assert_eq!(out.notices.len(), 1);
        let requests = transport.requests();
        let contents: Vec<&str> = requests[2].messages().iter().map(Turn::content).collect();
        assert_eq!(contents, vec!["eeeeeeeeee"]);
        assert_eq!(session.store().len(), 6);
    }

    #[tokio::test]
    async fn injected_page_joins_the_user_turn() {
        let transport = ScriptedTransport::with(vec![Ok(completion("summary"))]);
        let mut session = ChatSession::new(transport.clone(), config())
            .with_page_fetcher(StaticFetcher(Ok("Page body text.".to_string())));
        let mut out = CaptureRenderer::default();

        session
            .handle_line("Summarize <<https://example.com>>", &mut out)
            .await;

        let requests = transport.requests();
        assert_eq!(
            roles(requests[0].messages()),
            vec![Role::System, Role::User]
        );
        assert_eq!(
            requests[0].messages()[1].content(),
            "Summarize\n\nPage body text."
        );
        assert_eq!(session.store().len(), 3);
    }

    #[tokio::test]
    async fn long_page_is_truncated_with_notice() {
        let transport = ScriptedTransport::with(vec![Ok(completion("summary"))]);
        let config = config().with_max_page_chars(300);
        let mut session = ChatSession::new(transport.clone(), config)
            .with_page_fetcher(StaticFetcher(Ok("word ".repeat(200))));
        let mut out = CaptureRenderer::default();

        session.handle_line("<<https://example.com>>", &mut out).await;

        assert_eq!(out.notices.len(), 1);
        let requests = transport.requests();
        assert_eq!(requests[0].messages()[1].content().chars().count(), 300);
    }

    #[tokio::test]
    async fn failed_fetch_sends_nothing() {
        let transport = ScriptedTransport::default();
        let mut session = ChatSession::new(transport.clone(), config()).with_page_fetcher(
            StaticFetcher(Err(Error::connection("unreachable", None))),
        );
        let mut out = CaptureRenderer::default();

        let outcome = session.submit("Read <<https://example.com>>", &mut out).await;

        assert_eq!(outcome, RoundOutcome::Skipped);
        assert!(transport.requests().is_empty());
        assert_eq!(session.store().len(), 1);
        assert_eq!(out.errors.len(), 1);
    }

    #[tokio::test]
    async fn injections_can_be_disabled() {
        let transport = ScriptedTransport::with(vec![Ok(completion("ok"))]);
        let mut session = ChatSession::new(transport.clone(), config().with_injections(false))
            .with_page_fetcher(StaticFetcher(Ok("never".to_string())));
        let mut out = CaptureRenderer::default();

        session.handle_line("literal <<chevrons>>", &mut out).await;

        let requests = transport.requests();
        assert_eq!(requests[0].messages()[1].content(), "literal <<chevrons>>");
    }

    #[tokio::test(start_paused = true)]
    async fn three_transient_failures_then_one_reply() {
        let transport = ScriptedTransport::with(vec![
            Ok(unavailable()),
            Ok(unavailable()),
            Ok(unavailable()),
            Ok(completion("finally")),
        ]);
        let mut session = ChatSession::new(transport.clone(), config());
        let mut out = CaptureRenderer::default();

        assert_eq!(session.submit("hello", &mut out).await, RoundOutcome::Replied);
        assert_eq!(transport.requests().len(), 4);
        assert_eq!(
            roles(session.store().snapshot()),
            vec![Role::System, Role::User, Role::Assistant]
        );
        assert_eq!(session.store().snapshot()[2].content(), "finally");
        assert!(out.errors.is_empty());
    }

    #[tokio::test]
    async fn shift_operators_sent_verbatim() {
        let question = "Why does `x << 1 >> 2` differ from `x >> 2 << 1` in C?";
        let transport = ScriptedTransport::with(vec![Ok(completion("precedence"))]);
        let mut session = ChatSession::new(transport.clone(), config())
            .with_page_fetcher(StaticFetcher(Err(Error::connection("not called", None))));
        let mut out = CaptureRenderer::default();

        assert_eq!(session.submit(question, &mut out).await, RoundOutcome::Replied);
        assert!(out.errors.is_empty());
        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].messages()[1].content(), question);
    }

    #[tokio::test]
    async fn leading_path_is_a_message() {
        let line = "/usr/bin/python3 says permission denied, why?";
        let transport = ScriptedTransport::with(vec![Ok(completion("check chmod"))]);
        let mut session = ChatSession::new(transport.clone(), config());
        let mut out = CaptureRenderer::default();

        assert_eq!(session.handle_line(line, &mut out).await, Flow::Continue);
        assert!(out.errors.is_empty());
        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].messages()[1].content(), line);
        assert_eq!(session.store().len(), 3);
    }

    #[tokio::test]
    async fn quit_ends_session_without_request() {
        let transport = ScriptedTransport::default();
        let mut session = ChatSession::new(transport.clone(), config());
        let mut out = CaptureRenderer::default();

        assert_eq!(session.handle_line("exit", &mut out).await, Flow::Exit);
        assert_eq!(session.handle_line("hello", &mut out).await, Flow::Exit);
        assert!(transport.requests().is_empty());
        assert_eq!(session.state(), SessionState::Terminated);
    }
}
