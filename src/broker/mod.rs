use std::fmt::Display;

pub type BrokerResult<T> = Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Exchange,
    Queue,
}

impl Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Entity::Exchange => f.write_str("exchange"),
            Entity::Queue => f.write_str("queue"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Unknown exchange '{0}'")]
    UnknownExchange(String),

    #[error("Unknown queue '{0}'")]
    UnknownQueue(String),

    #[error("No {entity} named '{name}'")]
    NotFound { entity: Entity, name: String },

    #[error("Invalid exchange type: {0}")]
    InvalidKind(String),

    #[error("No bindings on '{exchange}' to route: {routing_key}")]
    NoRoute {
        exchange: String,
        routing_key: String,
    },

    #[error("x-match binding should be set to \"any\" or \"all\", got: {0}")]
    InvalidMatchType(String),

    #[error("Option '{key}' should be {expected}")]
    OptionTypeMismatch { key: String, expected: &'static str },

    #[error("Access refused: {0}")]
    AccessRefused(String),

    #[error("Channel is closed")]
    ChannelClosed,

    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Invalid value for {key}: {value}")]
    InvalidConfig { key: String, value: String },
}

impl Error {
    pub fn not_found(entity: Entity, name: impl Into<String>) -> Self {
        Error::NotFound {
            entity,
            name: name.into(),
        }
    }
}
