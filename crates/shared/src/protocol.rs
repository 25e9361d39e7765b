use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{FileId, ProjectId, TransformerId},
    models::{
        Created, FileData, FileRecord, FileUpdate, IdPayload, ProjectCreate, ProjectModel,
        ProjectRecord, ProjectUpdate, RawFile, TransformerCreate, TransformerModel,
        TransformerProgress, TransformerUpdate,
    },
    query::ListQuery,
};

pub const RESPONSE_SUFFIX: &str = ".resp";

macro_rules! event_kinds {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum EventKind {
            $(
                #[serde(rename = $name)]
                $variant,
            )+
        }

        impl EventKind {
            pub const ALL: &'static [EventKind] = &[$(EventKind::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(EventKind::$variant => $name,)+
                }
            }
        }

        impl FromStr for EventKind {
            type Err = String;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($name => Ok(EventKind::$variant),)+
                    other => Err(format!("unknown event kind '{other}'")),
                }
            }
        }
    };
}

event_kinds! {
    FilesCreate => "files.create",
    FilesImport => "files.import",
    FilesUpdate => "files.update",
    FilesDelete => "files.delete",
    FilesGet => "files.get",
    FilesList => "files.list",
    FilesPub => "files.pub",
    ProjectsCreate => "projects.create",
    ProjectsUpdate => "projects.update",
    ProjectsAssign => "projects.assign",
    ProjectsDelete => "projects.delete",
    ProjectsGet => "projects.get",
    ProjectsList => "projects.list",
    ProjectsPub => "projects.pub",
    TransformersCreate => "transformers.create",
    TransformersUpdate => "transformers.update",
    TransformersDelete => "transformers.delete",
    TransformersGet => "transformers.get",
    TransformersList => "transformers.list",
    TransformersExecute => "transformers.execute",
    TransformersStop => "transformers.stop",
    TransformersPub => "transformers.pub",
    SystemReset => "system.reset",
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing key on the bus: a request kind or the response channel of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Topic {
    Event(EventKind),
    Response(EventKind),
}

impl Topic {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Event(kind) | Self::Response(kind) => *kind,
        }
    }
}

impl From<EventKind> for Topic {
    fn from(value: EventKind) -> Self {
        Self::Event(value)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Event(kind) => write!(f, "{kind}"),
            Self::Response(kind) => write!(f, "{kind}{RESPONSE_SUFFIX}"),
        }
    }
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.strip_suffix(RESPONSE_SUFFIX) {
            Some(kind) => kind.parse().map(Self::Response),
            None => value.parse().map(Self::Event),
        }
    }
}

impl TryFrom<String> for Topic {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Topic> for String {
    fn from(value: Topic) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Success,
    Error,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: EventId,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub event_id: EventId,
    pub kind: Topic,
    pub response_id: u32,
    pub final_response: bool,
    pub timestamp: DateTime<Utc>,
    pub status: EventStatus,
    pub payload: Value,
    pub original: EventEnvelope,
}

/// A typed request payload bound to its event kind and final response type.
pub trait Request: Serialize + Send + Sync {
    const KIND: EventKind;
    type Response: DeserializeOwned + Send;
}

macro_rules! request {
    ($request:ty => $kind:ident, $response:ty) => {
        impl Request for $request {
            const KIND: EventKind = EventKind::$kind;
            type Response = $response;
        }
    };
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateFile(pub FileData);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportFile {
    pub file: RawFile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateFile {
    pub id: FileId,
    pub data: FileUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteFiles {
    pub ids: Vec<FileId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetFile {
    pub id: FileId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListFiles(pub ListQuery);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateProject(pub ProjectCreate);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateProject {
    pub id: ProjectId,
    pub data: ProjectUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignFiles {
    pub id: ProjectId,
    pub file_ids: Vec<FileId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteProject {
    pub id: ProjectId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetProject {
    pub id: ProjectId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListProjects(pub ListQuery);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTransformer(pub TransformerCreate);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateTransformer {
    pub id: TransformerId,
    pub data: TransformerUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteTransformer {
    pub id: TransformerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetTransformer {
    pub id: TransformerId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListTransformers(pub ListQuery);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteTransformer {
    pub id: TransformerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopTransformer {
    pub id: TransformerId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResetSystem;

request!(CreateFile => FilesCreate, IdPayload<FileId>);
request!(ImportFile => FilesImport, Created<FileId, FileRecord>);
request!(UpdateFile => FilesUpdate, ());
request!(DeleteFiles => FilesDelete, ());
request!(GetFile => FilesGet, FileRecord);
request!(ListFiles => FilesList, Vec<FileRecord>);
request!(CreateProject => ProjectsCreate, Created<ProjectId, ProjectRecord>);
request!(UpdateProject => ProjectsUpdate, ());
request!(AssignFiles => ProjectsAssign, ());
request!(DeleteProject => ProjectsDelete, ());
request!(GetProject => ProjectsGet, ProjectModel);
request!(ListProjects => ProjectsList, Vec<ProjectModel>);
request!(CreateTransformer => TransformersCreate, IdPayload<TransformerId>);
request!(UpdateTransformer => TransformersUpdate, ());
request!(DeleteTransformer => TransformersDelete, ());
request!(GetTransformer => TransformersGet, TransformerModel);
request!(ListTransformers => TransformersList, Vec<TransformerModel>);
request!(ExecuteTransformer => TransformersExecute, TransformerProgress);
request!(StopTransformer => TransformersStop, TransformerProgress);
request!(ResetSystem => SystemReset, ());

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
