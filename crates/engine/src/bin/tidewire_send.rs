use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use snafu::{OptionExt, ResultExt, Snafu};
use tokio_util::sync::CancellationToken;

use tidewire::{
    ConversationId, ConversationStore, EngineError, ReconciliationEngine, SendRequest,
    SettingsStore, StaticAgentCatalog,
};

#[derive(Debug, Clone)]
struct SendArgs {
    conversation_id: String,
    message: String,
    streaming: Option<bool>,
    config_path: Option<PathBuf>,
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required argument '{arg}'"))]
    MissingArgument {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("engine failed on `{stage}`: {source}"))]
    Engine {
        stage: &'static str,
        source: EngineError,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    if let Err(error) = run().await {
        println!("send_ok=false");
        eprintln!("send_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;

    let settings = match args.config_path {
        Some(path) => SettingsStore::new(path),
        None => SettingsStore::load(),
    };
    let settings = settings.settings();
    println!("base_url={}", settings.base_url);

    let store = ConversationStore::new();
    // This command has no agent listing, so bridge fields are never sent.
    let engine = ReconciliationEngine::with_http(
        settings,
        Arc::new(StaticAgentCatalog::unknown()),
        store.clone(),
    )
    .context(EngineSnafu {
        stage: "build-engine",
    })?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; cancelling send");
            on_interrupt.cancel();
        }
    });

    let mut request = SendRequest::chat(args.conversation_id.clone(), args.message);
    if let Some(streaming) = args.streaming {
        request = request.with_streaming(streaming);
    }

    let result = engine.send(request, cancel).await;
    if let Ok(conversation_id) = ConversationId::parse(&args.conversation_id) {
        print_timeline(&store, &conversation_id);
    }

    match result {
        Ok(outcome) => {
            println!("status={:?}", outcome.status);
            if let Some(run) = outcome.baseline_run {
                println!("run_id={} run_status={:?}", run.run_id, run.status);
                if let Some(error_code) = run.error_code {
                    println!("error_code={error_code}");
                }
            }
            println!("send_ok=true");
            Ok(())
        }
        Err(error) if error.is_cancellation() => {
            println!("status=cancelled");
            println!("send_ok=true");
            Ok(())
        }
        Err(source) => Err(RunnerError::Engine {
            stage: "send",
            source,
        }),
    }
}

fn print_timeline(store: &ConversationStore, conversation_id: &ConversationId) {
    let Some(timeline) = store.timeline(conversation_id) else {
        return;
    };

    for entry in timeline.entries().iter().rev() {
        println!(
            "[{}] {}: {}",
            entry.id(),
            entry.message.role.as_str(),
            entry.message.content
        );
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<SendArgs> {
    let mut conversation_id = None;
    let mut message = None;
    let mut streaming = None;
    let mut config_path = None;
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--conversation" => {
                conversation_id = Some(pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-conversation-value",
                    arg: "--conversation",
                })?);
            }
            "--message" => {
                message = Some(pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-message-value",
                    arg: "--message",
                })?);
            }
            "--no-stream" => streaming = Some(false),
            "--config" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-config-value",
                    arg: "--config",
                })?;
                config_path = Some(PathBuf::from(value));
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

    Ok(SendArgs {
        conversation_id: conversation_id.context(MissingArgumentSnafu {
            stage: "parse-args-conversation-required",
            arg: "--conversation",
        })?,
        message: message.context(MissingArgumentSnafu {
            stage: "parse-args-message-required",
            arg: "--message",
        })?,
        streaming,
        config_path,
    })
}
