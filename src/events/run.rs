use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize, strum::AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunEvent {
    Started,
    Succeeded,
    Failed {
        error: String,
    },
    Cancelled,
}
