use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::NaiveTime;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::{
    arg_parser::ArgsOptions, senders::chat::ShiftWindow,
    snapshot::DEFAULT_EXCLUDED_PROCESSES,
};

const DEFAULT_CHECK_PERIOD: u64 = 25;
const DEFAULT_WARN_AFTER: u64 = 350;
const DEFAULT_WARNING_INTERVAL: u64 = 3600;
const DEFAULT_COMMAND_TIMEOUT: u64 = 20;
const DEFAULT_LOG_FILE: &str = "logs.txt";

const DEFAULT_TOKEN_REFRESH: u64 = 31 * 60;
const DEFAULT_SHIFT_START: &str = "09:00";
const DEFAULT_SHIFT_END: &str = "21:00";
const DEFAULT_REQUEST_TIMEOUT: u64 = 30;

const SHIFT_FORMAT: &str = "%H:%M";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to open configuration file {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },
    #[error("Failed to parse configuration file {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        error: serde_json::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// Layout of the JSON configuration file, every key is optional
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub check_period_seconds: Option<u64>,
    pub warn_after_seconds: Option<u64>,
    pub warning_interval_seconds: Option<u64>,
    pub machine_name: Option<String>,
    pub people: Option<Vec<String>>,
    pub excluded_processes: Option<Vec<String>>,

    pub command_timeout_seconds: Option<u64>,
    pub terminal: Option<bool>,
    pub log_file: Option<PathBuf>,
    pub chat: Option<ChatFileConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatFileConfig {
    pub messages_url: String,
    pub members_url: String,
    // Program and arguments printing a bearer token on stdout
    pub token_command: Vec<String>,

    #[serde(default = "default_token_refresh")]
    pub token_refresh_seconds: u64,
    #[serde(default = "default_shift_start")]
    pub shift_start: String,
    #[serde(default = "default_shift_end")]
    pub shift_end: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_token_refresh() -> u64 {
    DEFAULT_TOKEN_REFRESH
}

fn default_shift_start() -> String {
    DEFAULT_SHIFT_START.to_string()
}

fn default_shift_end() -> String {
    DEFAULT_SHIFT_END.to_string()
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatConfig {
    pub messages_url: String,
    pub members_url: String,
    pub token_command: Vec<String>,
    pub token_refresh: Duration,
    pub shift: ShiftWindow,
    pub request_timeout: Duration,
}

// Validated daemon configuration, immutable once loaded
#[derive(Debug, Clone, PartialEq)]
pub struct WardenConfig {
    pub check_period_seconds: u64,
    pub warn_after_seconds: u64,
    pub warning_interval_seconds: u64,
    pub machine_name: String,
    pub people: Vec<String>,
    pub excluded_processes: Vec<String>,

    pub command_timeout: Duration,
    pub terminal: bool,
    pub log_file: Option<PathBuf>,
    pub chat: Option<ChatConfig>,
}

impl WardenConfig {
    // Merge the defaults, the configuration file given on the
    // command line (if any) and the command line options
    pub fn load(args: &ArgsOptions) -> Result<Self, ConfigError> {
        let file = match &args.config_file_path {
            Some(path) => read_config_file(path)?,
            None => FileConfig::default(),
        };

        Self::from_sources(file, args)
    }

    pub fn from_sources(
        file: FileConfig,
        args: &ArgsOptions,
    ) -> Result<Self, ConfigError> {
        let check_period_seconds = positive(
            "check period",
            args.check_period
                .or(file.check_period_seconds)
                .unwrap_or(DEFAULT_CHECK_PERIOD),
        )?;
        let warn_after_seconds = positive(
            "warn after",
            args.warn_after
                .or(file.warn_after_seconds)
                .unwrap_or(DEFAULT_WARN_AFTER),
        )?;
        let warning_interval_seconds = positive(
            "warning interval",
            args.warning_interval
                .or(file.warning_interval_seconds)
                .unwrap_or(DEFAULT_WARNING_INTERVAL),
        )?;
        let command_timeout = positive(
            "command timeout",
            args.command_timeout
                .or(file.command_timeout_seconds)
                .unwrap_or(DEFAULT_COMMAND_TIMEOUT),
        )?;

        let machine_name = args
            .machine_name
            .clone()
            .or(file.machine_name)
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                ConfigError::Invalid("a machine name is required".to_string())
            })?;

        let people = match &args.people {
            Some(list) => split_list(list),
            None => clean_list(file.people.unwrap_or_default()),
        };

        let excluded_processes = match &args.excluded_processes {
            Some(list) => split_list(list),
            None => match file.excluded_processes {
                Some(list) => clean_list(list),
                None => DEFAULT_EXCLUDED_PROCESSES
                    .iter()
                    .map(|name| name.to_string())
                    .collect(),
            },
        };

        let terminal = !args.no_terminal && file.terminal.unwrap_or(true);

        let log_file = args
            .log_file
            .clone()
            .or(file.log_file)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE));
        let log_file = (!log_file.as_os_str().is_empty()).then_some(log_file);

        let chat = file.chat.map(ChatConfig::try_from).transpose()?;

        Ok(Self {
            check_period_seconds,
            warn_after_seconds,
            warning_interval_seconds,
            machine_name,
            people,
            excluded_processes,
            command_timeout: Duration::from_secs(command_timeout),
            terminal,
            log_file,
            chat,
        })
    }
}

impl TryFrom<ChatFileConfig> for ChatConfig {
    type Error = ConfigError;

    fn try_from(chat: ChatFileConfig) -> Result<Self, Self::Error> {
        if chat.messages_url.trim().is_empty() {
            return Err(ConfigError::Invalid("chat messages_url is empty".to_string()));
        }
        if chat.members_url.trim().is_empty() {
            return Err(ConfigError::Invalid("chat members_url is empty".to_string()));
        }
        if chat.token_command.first().is_none_or(|p| p.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "chat token_command needs a program".to_string(),
            ));
        }

        let shift = ShiftWindow {
            start: parse_shift_time("shift_start", &chat.shift_start)?,
            end: parse_shift_time("shift_end", &chat.shift_end)?,
        };

        Ok(Self {
            messages_url: chat.messages_url,
            members_url: chat.members_url,
            token_command: chat.token_command,
            token_refresh: Duration::from_secs(positive(
                "chat token refresh",
                chat.token_refresh_seconds,
            )?),
            shift,
            request_timeout: Duration::from_secs(positive(
                "chat request timeout",
                chat.request_timeout_seconds,
            )?),
        })
    }
}

pub fn read_config_file(path: &Path) -> Result<FileConfig, ConfigError> {
    debug!("Parsing config file at: {:?}", path);

    let file = File::open(path).map_err(|error| ConfigError::Read {
        path: path.to_path_buf(),
        error,
    })?;

    serde_json::from_reader(BufReader::new(file)).map_err(|error| {
        ConfigError::Parse {
            path: path.to_path_buf(),
            error,
        }
    })
}

// Split a comma separated list, dropping empty entries
pub fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}

fn clean_list(list: Vec<String>) -> Vec<String> {
    list.into_iter()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

fn positive(name: &str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid(format!("{name} must be positive")));
    }

    Ok(value)
}

fn parse_shift_time(name: &str, value: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value.trim(), SHIFT_FORMAT).map_err(|_| {
        ConfigError::Invalid(format!("{name} \"{value}\" is not a HH:MM time"))
    })
}
