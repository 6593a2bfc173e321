use anyhow::{Context, anyhow};
use clap::{Parser, ValueEnum};
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{Event, Namespace, Node, Pod, Service};
use k8s_openapi::serde_json;
use kube::Client;
use kubecast::k8s::cache::{CacheConfig, ObjectView, ResourceView, SummaryView};
use kubecast::k8s::client::{ConnectionProfile, KubeConnector};
use kubecast::k8s::context::StreamContext;
use kubecast::k8s::controller::ResourceController;
use kubecast::k8s::registry::{ConnectionKey, Connector};
use kubecast::k8s::source::{KubeBinder, Object};
use kubecast::k8s::stream::{StreamQuery, Subscriber, encode_frame};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Kind {
    Namespace,
    Node,
    Pod,
    ReplicaSet,
    Deployment,
    Service,
    Event,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Tail snapshots as server-sent events until interrupted
    Stream,
    List,
    Detail,
    Yaml,
    /// Print the contexts of the kubeconfig and exit
    Contexts,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, value_enum, default_value_t = Kind::Pod)]
    kind: Kind,

    #[arg(short, long, value_enum, default_value_t = Mode::Stream)]
    mode: Mode,

    /// Limit to one namespace
    #[arg(short, long)]
    namespace: Option<String>,

    /// Limit to one object
    #[arg(long)]
    name: Option<String>,

    /// Sub-stream of the named object: `events`, or `pods` for the pods it owns
    #[arg(short, long)]
    qualifier: Option<String>,

    #[arg(long, default_value = "default")]
    profile: String,

    /// Kubeconfig file; defaults to KUBECONFIG or ~/.kube/config
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig context; defaults to the current context
    #[arg(short, long)]
    context: Option<String>,

    /// Stream full objects instead of summary rows
    #[arg(long)]
    full: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn view<K: Object>(full: bool) -> Arc<dyn ResourceView<K>> {
    if full {
        Arc::new(ObjectView)
    } else {
        Arc::new(SummaryView)
    }
}

fn controller<K: Object>(
    ctx: &Arc<StreamContext<Client>>,
    binder: KubeBinder<K>,
    args: &Args,
    events: &Arc<ResourceController<Client, Event>>,
) -> ResourceController<Client, K> {
    ResourceController::new(Arc::clone(ctx), Arc::new(binder), view::<K>(args.full))
        .with_events(Arc::clone(events))
}

fn required_name(args: &Args) -> anyhow::Result<&str> {
    args.name
        .as_deref()
        .ok_or_else(|| anyhow!("--name is required for {:?}", args.mode))
}

async fn tail(mut subscriber: Subscriber) -> anyhow::Result<()> {
    info!("📡 Tailing {}", subscriber.topic());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("👋 Interrupted");
                break;
            }
            frame = subscriber.next_frame() => match frame? {
                Some(frame) => {
                    let mut out = std::io::stdout().lock();
                    out.write_all(&encode_frame(&frame))?;
                    out.flush()?;
                }
                None => {
                    info!("🔌 Stream closed");
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn run<K: Object>(
    controller: &ResourceController<Client, K>,
    pods: &ResourceController<Client, Pod>,
    key: &ConnectionKey,
    args: &Args,
) -> anyhow::Result<()> {
    let namespace = args.namespace.as_deref();
    match args.mode {
        Mode::List => {
            let payload = controller.list(key, namespace).await?;
            println!("{}", String::from_utf8_lossy(&payload));
        }
        Mode::Detail => {
            let detail = controller.detail(key, required_name(args)?, namespace).await?;
            println!("{}", serde_json::to_string_pretty(&detail)?);
        }
        Mode::Yaml => {
            print!("{}", controller.yaml(key, required_name(args)?, namespace).await?);
        }
        Mode::Stream if args.qualifier.as_deref() == Some("pods") => {
            let subscriber = controller
                .owned(pods, key, required_name(args)?, namespace)
                .await?;
            tail(subscriber).await?;
        }
        Mode::Stream => {
            let mut query = StreamQuery::new(key.clone());
            query.namespace.clone_from(&args.namespace);
            query.name.clone_from(&args.name);
            query.qualifier.clone_from(&args.qualifier);
            tail(controller.subscribe(&query).await?).await?;
        }
        Mode::Contexts => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing();
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow!("failed to install rustls crypto provider"))?;

    let profile = ConnectionProfile::new(args.profile.clone(), args.kubeconfig.clone());
    if args.mode == Mode::Contexts {
        for context in profile.contexts()? {
            println!("{context}");
        }
        return Ok(());
    }

    let cluster = match &args.context {
        Some(context) => context.clone(),
        None => profile
            .current_context()?
            .context("no --context given and the kubeconfig has no current-context")?,
    };
    let key = ConnectionKey::new(args.profile.clone(), cluster);

    let connector = Arc::new(KubeConnector::new());
    connector.upsert(profile);
    let ctx = StreamContext::new(
        connector as Arc<dyn Connector<Client = Client>>,
        CacheConfig::from_env(),
    );

    let events = Arc::new(ResourceController::new(
        Arc::clone(&ctx),
        Arc::new(KubeBinder::<Event>::namespaced()),
        view::<Event>(args.full),
    ));
    let pods = controller(&ctx, KubeBinder::<Pod>::namespaced(), &args, &events);

    match args.kind {
        Kind::Pod => run(&pods, &pods, &key, &args).await,
        Kind::Event => run(events.as_ref(), &pods, &key, &args).await,
        Kind::Namespace => {
            let namespaces = controller(&ctx, KubeBinder::<Namespace>::cluster(), &args, &events);
            run(&namespaces, &pods, &key, &args).await
        }
        Kind::Node => {
            let nodes = controller(&ctx, KubeBinder::<Node>::cluster(), &args, &events);
            run(&nodes, &pods, &key, &args).await
        }
        Kind::ReplicaSet => {
            let replicasets =
                controller(&ctx, KubeBinder::<ReplicaSet>::namespaced(), &args, &events);
            run(&replicasets, &pods, &key, &args).await
        }
        Kind::Deployment => {
            let deployments =
                controller(&ctx, KubeBinder::<Deployment>::namespaced(), &args, &events);
            run(&deployments, &pods, &key, &args).await
        }
        Kind::Service => {
            let services = controller(&ctx, KubeBinder::<Service>::namespaced(), &args, &events);
            run(&services, &pods, &key, &args).await
        }
    }
}
