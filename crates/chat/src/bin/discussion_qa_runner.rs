use std::collections::HashSet;
use std::env;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use futures::future::join_all;
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::sync::watch;

use gallery_chat::{
    ActionOutcome, ChannelEvent, ChatController, ChatError, ChatSettings, IdentityBinder,
    LiveChannel, MemoryMessageStore, MessageId, MessageStore, ModerationFilter, PresentationQueue,
    ServerClock, Session, SessionAuth, SessionRole, SqliteMessageStore, StorageError, SystemClock,
    TopicId, TopicSnapshot,
};

const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(5);
const CONCURRENT_CLIENTS: usize = 8;

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    db_path: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    ModerationMask,
    MessageRoundtrip,
    ConcurrentOrdering,
    DeleteGuard,
    EmptyTopic,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "moderation_mask" => Some(Self::ModerationMask),
            "message_roundtrip" => Some(Self::MessageRoundtrip),
            "concurrent_ordering" => Some(Self::ConcurrentOrdering),
            "delete_guard" => Some(Self::DeleteGuard),
            "empty_topic" => Some(Self::EmptyTopic),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::ModerationMask => "moderation_mask",
            Self::MessageRoundtrip => "message_roundtrip",
            Self::ConcurrentOrdering => "concurrent_ordering",
            Self::DeleteGuard => "delete_guard",
            Self::EmptyTopic => "empty_topic",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("store setup failed: {source}"))]
    StoreSetup {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("chat call failed: {source}"))]
    Chat {
        stage: &'static str,
        source: ChatError,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    println!("scenario={}", args.scenario.name());
    if let Some(db_path) = args.db_path.as_deref() {
        println!("db_path={db_path}");
    }

    let store = open_store(args.db_path.as_deref()).await?;
    let settings = ChatSettings::load();
    let moderation = Arc::new(settings.moderation_filter().context(ChatSnafu {
        stage: "runner-moderation-filter",
    })?);
    let harness = Harness {
        store,
        moderation,
        settings,
        next_topic: AtomicI64::new(SystemClock.now().unix_micros()),
    };

    match args.scenario {
        Scenario::ModerationMask => harness.run_moderation_mask().await?,
        Scenario::MessageRoundtrip => harness.run_message_roundtrip().await?,
        Scenario::ConcurrentOrdering => harness.run_concurrent_ordering().await?,
        Scenario::DeleteGuard => harness.run_delete_guard().await?,
        Scenario::EmptyTopic => harness.run_empty_topic().await?,
        Scenario::All => {
            harness.run_moderation_mask().await?;
            harness.run_message_roundtrip().await?;
            harness.run_concurrent_ordering().await?;
            harness.run_delete_guard().await?;
            harness.run_empty_topic().await?;
            println!("all_passed=true");
        }
    }

    println!("runner_ok=true");
    Ok(())
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut db_path = None;
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;

                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenario = Some(parsed);
            }
            "--db" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-db-value",
                    arg: "--db",
                })?;
                db_path = Some(value);
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args-scenario-required",
        })?,
        db_path,
    })
}

async fn open_store(db_path: Option<&str>) -> RunnerResult<Arc<dyn MessageStore>> {
    match db_path {
        Some(path) => {
            let store = SqliteMessageStore::open(path)
                .await
                .context(StoreSetupSnafu {
                    stage: "runner-open-sqlite",
                })?;
            println!("store=sqlite");
            Ok(Arc::new(store))
        }
        None => {
            println!("store=memory");
            Ok(Arc::new(MemoryMessageStore::new()))
        }
    }
}

struct Harness {
    store: Arc<dyn MessageStore>,
    moderation: Arc<ModerationFilter>,
    settings: ChatSettings,
    next_topic: AtomicI64,
}

impl Harness {
    /// Topics are unique per run so a reused database file never leaks state between runs.
    fn fresh_topic(&self) -> TopicId {
        TopicId::new(self.next_topic.fetch_add(1, Ordering::SeqCst))
    }

    fn open_controller(
        &self,
        topic_id: TopicId,
        session: Option<Session>,
    ) -> RunnerResult<ChatController> {
        let auth = match session {
            Some(session) => SessionAuth::signed_in(session),
            None => SessionAuth::new(),
        };
        let identity: IdentityBinder = self.settings.identity_binder(Arc::new(auth));
        ChatController::open(
            topic_id,
            Arc::clone(&self.store),
            identity,
            Arc::clone(&self.moderation),
        )
        .context(ChatSnafu {
            stage: "runner-open-controller",
        })
    }

    async fn run_moderation_mask(&self) -> RunnerResult<()> {
        let scenario = "moderation_mask";
        let Some(denied) = self.moderation.deny_list().first().cloned() else {
            println!("moderation_skipped=empty_deny_list");
            return Ok(());
        };

        let controller = self.open_controller(self.fresh_topic(), None)?;
        let mut messages = controller.messages();
        let outcome = controller
            .send(&format!("you are a {}", denied.to_uppercase()))
            .outcome()
            .await
            .context(ChatSnafu {
                stage: "scenario-moderation-send",
            })?;
        expect_sent(scenario, outcome)?;

        let snapshot = wait_for(scenario, &mut messages, |snapshot| snapshot.len() == 1).await?;
        let observed = snapshot.texts().join("");
        println!("moderation_observed={observed}");
        check(
            scenario,
            self.moderation.is_clean(&observed) && observed == self.moderation.apply(&observed),
            format!("deny-listed text survived moderation: {observed}"),
        )?;

        println!("moderation_mask=true");
        Ok(())
    }

    async fn run_message_roundtrip(&self) -> RunnerResult<()> {
        let scenario = "message_roundtrip";
        let controller = self.open_controller(
            self.fresh_topic(),
            Some(Session::new("qa-roundtrip", Some("QA".to_string()))),
        )?;
        let mut messages = controller.messages();
        let before = SystemClock.now();

        let outcome = controller
            .send("hello")
            .outcome()
            .await
            .context(ChatSnafu {
                stage: "scenario-roundtrip-send",
            })?;
        let sent_id = expect_sent(scenario, outcome)?;

        let snapshot = wait_for(scenario, &mut messages, |snapshot| !snapshot.is_empty()).await?;
        let message = snapshot.last().context(ScenarioFailedSnafu {
            stage: "scenario-roundtrip-last",
            scenario,
            reason: "snapshot lost the appended message".to_string(),
        })?;

        check(
            scenario,
            message.id == sent_id
                && message.text == "hello"
                && message.timestamp >= before
                && message.author_display_name.as_deref() == Some("QA"),
            format!("unexpected round-trip message: {message:?}"),
        )?;

        let mut queue = PresentationQueue::new(self.settings.anonymous_label.clone());
        let scroll = queue.apply_snapshot(&snapshot);
        check(
            scenario,
            scroll.and_then(|scroll| scroll.latest) == Some(sent_id),
            "new trailing message did not request scroll".to_string(),
        )?;

        println!("roundtrip_message_id={sent_id}");
        println!("message_roundtrip=true");
        Ok(())
    }

    async fn run_concurrent_ordering(&self) -> RunnerResult<()> {
        let scenario = "concurrent_ordering";
        let topic_id = self.fresh_topic();
        let clients = (0..CONCURRENT_CLIENTS)
            .map(|index| {
                self.open_controller(
                    topic_id,
                    Some(Session::new(format!("qa-{index}"), Some(format!("Client {index}")))),
                )
            })
            .collect::<RunnerResult<Vec<_>>>()?;

        let completions = clients
            .iter()
            .enumerate()
            .map(|(index, client)| client.send(&format!("message {index}")).outcome());
        let outcomes = join_all(completions).await;
        for outcome in outcomes {
            let outcome = outcome.context(ChatSnafu {
                stage: "scenario-concurrent-send",
            })?;
            expect_sent(scenario, outcome)?;
        }

        for client in &clients {
            let mut messages = client.messages();
            let snapshot = wait_for(scenario, &mut messages, |snapshot| {
                snapshot.len() == CONCURRENT_CLIENTS
            })
            .await?;

            let keys = snapshot
                .iter()
                .map(|message| message.ordering_key())
                .collect::<Vec<_>>();
            let sorted = keys.windows(2).all(|pair| pair[0] < pair[1]);
            let unique = snapshot
                .iter()
                .map(|message| message.id)
                .collect::<HashSet<_>>()
                .len()
                == snapshot.len();
            check(
                scenario,
                sorted && unique,
                format!("snapshot out of order or duplicated: {:?}", snapshot.texts()),
            )?;
        }

        println!("concurrent_clients={CONCURRENT_CLIENTS}");
        println!("concurrent_ordering=true");
        Ok(())
    }

    async fn run_delete_guard(&self) -> RunnerResult<()> {
        let scenario = "delete_guard";
        let topic_id = self.fresh_topic();
        let member = self.open_controller(topic_id, Some(Session::new("qa-member", None)))?;
        let moderator = self.open_controller(
            topic_id,
            Some(Session::new("qa-moderator", None).with_role(SessionRole::Moderator)),
        )?;
        let mut messages = moderator.messages();

        let outcome = member
            .send("keep me")
            .outcome()
            .await
            .context(ChatSnafu {
                stage: "scenario-delete-send",
            })?;
        let message_id = expect_sent(scenario, outcome)?;
        wait_for(scenario, &mut messages, |snapshot| snapshot.len() == 1).await?;

        let denied = member
            .delete(message_id)
            .outcome()
            .await
            .context(ChatSnafu {
                stage: "scenario-delete-unprivileged",
            })?;
        check(
            scenario,
            denied == ActionOutcome::Skipped && moderator.snapshot().len() == 1,
            format!("unprivileged delete was not ignored: {denied:?}"),
        )?;

        let deleted = moderator
            .delete(message_id)
            .outcome()
            .await
            .context(ChatSnafu {
                stage: "scenario-delete-privileged",
            })?;
        check(
            scenario,
            deleted == ActionOutcome::Deleted(message_id),
            format!("privileged delete did not report success: {deleted:?}"),
        )?;
        wait_for(scenario, &mut messages, TopicSnapshot::is_empty).await?;

        let missing = moderator.delete(message_id).outcome().await;
        let reported_not_found = matches!(&missing, Err(error) if error.is_not_found());
        println!("delete_missing_reported={reported_not_found}");
        check(
            scenario,
            reported_not_found && moderator.channel_state().is_listening(),
            format!("deleting a missing id was not reported cleanly: {missing:?}"),
        )?;

        println!("delete_guard=true");
        Ok(())
    }

    async fn run_empty_topic(&self) -> RunnerResult<()> {
        let scenario = "empty_topic";
        let mut channel = LiveChannel::new(self.fresh_topic(), Arc::clone(&self.store));
        let mut subscription = channel.subscribe().context(ChatSnafu {
            stage: "scenario-empty-subscribe",
        })?;

        let delivered = match tokio::time::timeout(SNAPSHOT_TIMEOUT, subscription.recv()).await {
            Ok(Some(ChannelEvent::Snapshot(snapshot))) => snapshot,
            Ok(Some(ChannelEvent::Failed(error))) => {
                return Err(error).context(ChatSnafu {
                    stage: "scenario-empty-failed",
                });
            }
            Ok(None) => {
                return ScenarioFailedSnafu {
                    stage: "scenario-empty-closed",
                    scenario,
                    reason: "subscription ended before the first snapshot".to_string(),
                }
                .fail();
            }
            Err(_) => {
                return ScenarioFailedSnafu {
                    stage: "scenario-empty-timeout",
                    scenario,
                    reason: format!("no snapshot within {SNAPSHOT_TIMEOUT:?}"),
                }
                .fail();
            }
        };
        check(
            scenario,
            delivered.is_empty() && channel.state().is_listening(),
            format!("empty topic produced {} messages", delivered.len()),
        )?;
        channel.dispose();

        println!("empty_topic=true");
        Ok(())
    }
}

fn expect_sent(
    scenario: &'static str,
    outcome: ActionOutcome,
) -> RunnerResult<MessageId> {
    match outcome {
        ActionOutcome::Sent(message_id) => Ok(message_id),
        other => ScenarioFailedSnafu {
            stage: "scenario-expect-sent",
            scenario,
            reason: format!("expected a sent message, got {other:?}"),
        }
        .fail(),
    }
}

fn check(scenario: &'static str, condition: bool, reason: String) -> RunnerResult<()> {
    if condition {
        return Ok(());
    }

    ScenarioFailedSnafu {
        stage: "scenario-check",
        scenario,
        reason,
    }
    .fail()
}

async fn wait_for<F>(
    scenario: &'static str,
    messages: &mut watch::Receiver<TopicSnapshot>,
    predicate: F,
) -> RunnerResult<TopicSnapshot>
where
    F: FnMut(&TopicSnapshot) -> bool,
{
    match tokio::time::timeout(SNAPSHOT_TIMEOUT, messages.wait_for(predicate)).await {
        Ok(Ok(snapshot)) => Ok(snapshot.clone()),
        Ok(Err(_)) => ScenarioFailedSnafu {
            stage: "scenario-wait-closed",
            scenario,
            reason: "message list closed".to_string(),
        }
        .fail(),
        Err(_) => ScenarioFailedSnafu {
            stage: "scenario-wait-timeout",
            scenario,
            reason: format!("no matching snapshot within {SNAPSHOT_TIMEOUT:?}"),
        }
        .fail(),
    }
}
