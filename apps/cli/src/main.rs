use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use event_bus::Emitter;
use service::{EngineConfig, ServiceContext};
use shared::{
    domain::{FileId, ProjectId, TransformerId, TransformerSettings},
    models::{
        FileRecord, ProjectCreate, ProjectModel, RawFile, TransformerModel, TransformerProgress,
        TransformerUpdate,
    },
    protocol::{
        AssignFiles, CreateProject, DeleteFiles, DeleteProject, ExecuteTransformer, GetFile,
        GetProject, GetTransformer, ImportFile, ListFiles, ListProjects, Request, ResetSystem,
        StopTransformer, UpdateTransformer,
    },
};
use storage::Storage;
use tracing_subscriber::EnvFilter;

mod config;

use config::{load_settings, prepare_database_url};

#[derive(Parser, Debug)]
#[command(name = "komplett", about = "Convert local files in batches")]
struct Cli {
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    log_filter: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import files from disk.
    Import {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    #[command(subcommand)]
    Project(ProjectCommand),
    #[command(subcommand)]
    Transformer(TransformerCommand),
    #[command(subcommand)]
    Files(FilesCommand),
    /// Delete every file, project and transformer.
    Reset {
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ProjectCommand {
    Create {
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long = "file")]
        files: Vec<FileId>,
    },
    Assign {
        project_id: ProjectId,
        #[arg(required = true)]
        file_ids: Vec<FileId>,
    },
    Show {
        project_id: ProjectId,
    },
    List,
    Delete {
        project_id: ProjectId,
    },
}

#[derive(Subcommand, Debug)]
enum TransformerCommand {
    Show {
        id: TransformerId,
    },
    /// Replace the settings with a JSON object.
    Configure {
        id: TransformerId,
        settings: String,
    },
    /// Run the transformer. Ctrl-C stops it after the current file.
    Execute {
        id: TransformerId,
    },
}

#[derive(Subcommand, Debug)]
enum FilesCommand {
    List,
    Delete {
        #[arg(required = true)]
        ids: Vec<FileId>,
    },
    /// Write a stored file's bytes to disk.
    Save {
        id: FileId,
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = load_settings(cli.config.as_deref())?;
    if let Some(database_url) = cli.database_url {
        settings.database_url = database_url;
    }
    if let Some(log_filter) = cli.log_filter {
        settings.log_filter = log_filter;
    }

    let filter = EnvFilter::try_new(&settings.log_filter)
        .with_context(|| format!("invalid log filter '{}'", settings.log_filter))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url)
        .await
        .with_context(|| format!("failed to open database '{database_url}'"))?;

    let bus = Emitter::new();
    let ctx = ServiceContext::new(
        storage,
        bus.clone(),
        EngineConfig {
            step_timeout: settings.step_timeout(),
        },
    );
    let runtime = service::start(&ctx);

    let client = Client {
        bus,
        timeout: settings.request_timeout(),
    };
    let outcome = run(&client, cli.command).await;
    runtime.shutdown();
    outcome
}

struct Client {
    bus: Emitter,
    timeout: std::time::Duration,
}

impl Client {
    async fn call<R: Request>(&self, request: &R) -> Result<R::Response> {
        self.bus
            .call_within(request, self.timeout)
            .await
            .with_context(|| format!("{} failed", R::KIND))
    }
}

async fn run(client: &Client, command: Command) -> Result<()> {
    match command {
        Command::Import { paths } => {
            for path in paths {
                let bytes = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("failed to read '{}'", path.display()))?;
                let name = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .unwrap_or("file.bin")
                    .to_string();
                let mime_type = mime_guess::from_path(&path)
                    .first_raw()
                    .unwrap_or("application/octet-stream")
                    .to_string();

                let created = client
                    .call(&ImportFile {
                        file: RawFile {
                            name,
                            mime_type,
                            bytes,
                        },
                    })
                    .await?;
                print_file(&created.data);
            }
        }
        Command::Project(command) => run_project(client, command).await?,
        Command::Transformer(command) => run_transformer(client, command).await?,
        Command::Files(command) => run_files(client, command).await?,
        Command::Reset { yes } => {
            if !yes {
                bail!("reset deletes everything; pass --yes to confirm");
            }
            client.call(&ResetSystem).await?;
            println!("reset complete");
        }
    }
    Ok(())
}

async fn run_project(client: &Client, command: ProjectCommand) -> Result<()> {
    match command {
        ProjectCommand::Create {
            name,
            description,
            tags,
            files,
        } => {
            let created = client
                .call(&CreateProject(ProjectCreate {
                    name,
                    description,
                    file_ids: files,
                    tags,
                }))
                .await?;
            let project = client.call(&GetProject { id: created.id }).await?;
            print_project(&project);
        }
        ProjectCommand::Assign {
            project_id,
            file_ids,
        } => {
            client
                .call(&AssignFiles {
                    id: project_id,
                    file_ids,
                })
                .await?;
            let project = client.call(&GetProject { id: project_id }).await?;
            print_project(&project);
        }
        ProjectCommand::Show { project_id } => {
            let project = client.call(&GetProject { id: project_id }).await?;
            print_project(&project);
            for file in &project.files {
                print_file(file);
            }
        }
        ProjectCommand::List => {
            for project in client.call(&ListProjects::default()).await? {
                print_project(&project);
            }
        }
        ProjectCommand::Delete { project_id } => {
            client.call(&DeleteProject { id: project_id }).await?;
            println!("deleted project_id={project_id}");
        }
    }
    Ok(())
}

async fn run_transformer(client: &Client, command: TransformerCommand) -> Result<()> {
    match command {
        TransformerCommand::Show { id } => {
            let transformer = client.call(&GetTransformer { id }).await?;
            print_transformer(&transformer)?;
        }
        TransformerCommand::Configure { id, settings } => {
            let settings: TransformerSettings =
                serde_json::from_str(&settings).context("settings must be a JSON object")?;
            client
                .call(&UpdateTransformer {
                    id,
                    data: TransformerUpdate {
                        settings: Some(settings),
                    },
                })
                .await?;
            let transformer = client.call(&GetTransformer { id }).await?;
            print_transformer(&transformer)?;
        }
        TransformerCommand::Execute { id } => {
            let progress = execute(client, id).await?;
            println!("transformer_id={} status={}", progress.id, progress.status);
            let transformer = client.call(&GetTransformer { id }).await?;
            for file in &transformer.result_files {
                print_file(file);
            }
        }
    }
    Ok(())
}

async fn execute(client: &Client, id: TransformerId) -> Result<TransformerProgress> {
    let payload = ExecuteTransformer { id };
    let request = client
        .bus
        .call_with_updates(&payload, |response| {
            if response.final_response {
                return;
            }
            if let Ok(progress) = serde_json::from_value::<TransformerProgress>(response.payload.clone()) {
                eprintln!("transformer_id={} status={}", progress.id, progress.status);
            }
        });
    tokio::pin!(request);

    let progress = tokio::select! {
        outcome = &mut request => outcome?,
        _ = tokio::signal::ctrl_c() => {
            let stopping = client.call(&StopTransformer { id }).await?;
            eprintln!("stopping transformer_id={} after the current file", stopping.id);
            request.await?
        }
    };
    Ok(progress)
}

async fn run_files(client: &Client, command: FilesCommand) -> Result<()> {
    match command {
        FilesCommand::List => {
            for file in client.call(&ListFiles::default()).await? {
                print_file(&file);
            }
        }
        FilesCommand::Delete { ids } => {
            let count = ids.len();
            client.call(&DeleteFiles { ids }).await?;
            println!("deleted {count} file(s)");
        }
        FilesCommand::Save { id, path } => {
            let file = client.call(&GetFile { id }).await?;
            tokio::fs::write(&path, &file.data.blob)
                .await
                .with_context(|| format!("failed to write '{}'", path.display()))?;
            println!("saved file_id={id} to {}", path.display());
        }
    }
    Ok(())
}

fn print_file(file: &FileRecord) {
    let dimensions = file
        .data
        .metadata
        .dimensions()
        .map(|d| format!(" {}x{}", d.width, d.height))
        .unwrap_or_default();
    let source = file
        .data
        .source_file_id
        .map(|source| format!(" source_file_id={source}"))
        .unwrap_or_default();
    println!(
        "file_id={} name={} kind={} size={}{dimensions}{source}",
        file.id, file.data.name, file.data.kind, file.data.size
    );
}

fn print_project(project: &ProjectModel) {
    let transformer = project
        .transformer
        .as_ref()
        .map(|t| format!(" transformer_id={} status={}", t.id, t.data.status))
        .unwrap_or_default();
    println!(
        "project_id={} name={} kind={} files={} size={}{transformer}",
        project.project.id,
        project.project.data.name,
        project.kind,
        project.files.len(),
        project.size
    );
}

fn print_transformer(transformer: &TransformerModel) -> Result<()> {
    let record = &transformer.transformer;
    println!(
        "transformer_id={} kind={} status={} files={} results={}",
        record.id,
        record.data.kind,
        record.data.status,
        transformer.files.len(),
        transformer.result_files.len()
    );
    println!("{}", serde_json::to_string_pretty(&record.data.settings)?);
    Ok(())
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
