use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveTime};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    config::ChatConfig,
    credentials::{CredentialStore, TokenProvider, refresh_once},
    senders::{SenderError, WarningSender, format_header, format_time},
    snapshot::ProcessUsage,
};

// Local time range in which chat messages are allowed, bounds included.
// A start later than the end describes an overnight window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShiftWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl ShiftWindow {
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= time && time <= self.end
        } else {
            time >= self.start || time <= self.end
        }
    }
}

#[derive(Debug, Deserialize)]
struct MembersResponse {
    value: Vec<Member>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Member {
    display_name: String,
    user_id: String,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub body: MessageBody,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<Mention>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageBody {
    pub content_type: String,
    pub content: String,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Mention {
    pub id: usize,
    pub mention_text: String,
    pub mentioned: Mentioned,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct Mentioned {
    pub user: MentionedUser,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct MentionedUser {
    pub id: String,
}

// Post warnings to a group chat, mentioning the related people
pub struct ChatSender {
    machine_name: String,
    client: Client,
    messages_url: String,
    credential: CredentialStore,
    shift: ShiftWindow,

    // Normalized display name to chat user id
    member_ids: HashMap<String, String>,
}

impl ChatSender {
    pub fn new(
        machine_name: &str,
        messages_url: &str,
        shift: ShiftWindow,
        request_timeout: Duration,
        credential: CredentialStore,
    ) -> Result<Self, SenderError> {
        let client = Client::builder().timeout(request_timeout).build()?;

        Ok(Self {
            machine_name: machine_name.to_string(),
            client,
            messages_url: messages_url.to_string(),
            credential,
            shift,
            member_ids: HashMap::new(),
        })
    }

    // Fetch the first credential and the chat members. Only building the
    // client can fail, without a credential or members the sender still
    // starts and the refresher or plain names take over.
    pub async fn start(
        machine_name: &str,
        chat: &ChatConfig,
        credential: CredentialStore,
        provider: &dyn TokenProvider,
    ) -> Result<Self, SenderError> {
        refresh_once(&credential, provider).await;

        let mut sender = Self::new(
            machine_name,
            &chat.messages_url,
            chat.shift,
            chat.request_timeout,
            credential,
        )?;

        if let Err(err) = sender.load_members(&chat.members_url).await {
            warn!("Chat members unavailable, people won't be mentioned: {}", err);
        }

        Ok(sender)
    }

    // Fetch the chat members used to resolve mentions. Without them
    // people are still named in the message but not mentioned.
    pub async fn load_members(
        &mut self,
        members_url: &str,
    ) -> Result<usize, SenderError> {
        let token = self
            .credential
            .current()
            .await
            .ok_or(SenderError::MissingCredential)?;

        debug!("Fetching chat members from: {}", members_url);

        let response = self
            .client
            .get(members_url)
            .bearer_auth(token)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SenderError::Rejected { status, body });
        }

        let members: MembersResponse = response.json().await?;

        self.member_ids = members
            .value
            .into_iter()
            .map(|member| (normalize_name(&member.display_name), member.user_id))
            .collect();

        info!("Loaded {} chat members", self.member_ids.len());

        Ok(self.member_ids.len())
    }

    async fn send_at(
        &self,
        gpu_id: u32,
        processes: &[ProcessUsage],
        now: DateTime<Local>,
    ) -> Result<(), SenderError> {
        if !self.shift.contains(now.time()) {
            debug!("Outside of the chat shift window, not posting GPU {}", gpu_id);
            return Ok(());
        }

        let token = self
            .credential
            .current()
            .await
            .ok_or(SenderError::MissingCredential)?;

        let message = build_message(
            &self.machine_name,
            gpu_id,
            &format_time(&now),
            processes,
            &self.member_ids,
        );

        let response = self
            .client
            .post(&self.messages_url)
            .bearer_auth(token)
            .json(&message)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            warn!("Chat service answered {}: {}", status, body);
            return Err(SenderError::Rejected { status, body });
        }

        Ok(())
    }
}

#[async_trait]
impl WarningSender for ChatSender {
    fn name(&self) -> &str {
        "chat"
    }

    async fn send_warning(
        &self,
        gpu_id: u32,
        processes: &[ProcessUsage],
    ) -> Result<(), SenderError> {
        self.send_at(gpu_id, processes, Local::now()).await
    }
}

// Lowercase, collapse whitespace and fold the dotted i produced by
// lowercasing 'İ' so names compare equal across keyboards
pub fn normalize_name(name: &str) -> String {
    name.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace("i\u{307}", "i")
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub fn build_message(
    machine_name: &str,
    gpu_id: u32,
    time: &str,
    processes: &[ProcessUsage],
    member_ids: &HashMap<String, String>,
) -> ChatMessage {
    let header = format_header(machine_name, gpu_id, time);
    let header = escape_html(&header).replacen(
        &format!("[{}]", escape_html(machine_name)),
        &format!("<b>[{}]</b>", escape_html(machine_name)),
        1,
    );

    let mut content = format!("<u>{header}</u><br>");
    let mut mentions = Vec::new();

    for process in processes {
        let people: Vec<String> = process
            .related_people
            .iter()
            .flatten()
            .map(|person| match member_ids.get(&normalize_name(person)) {
                Some(user_id) => {
                    let id = mentions.len();
                    mentions.push(Mention {
                        id,
                        mention_text: person.clone(),
                        mentioned: Mentioned {
                            user: MentionedUser { id: user_id.clone() },
                        },
                    });
                    format!("<at id=\"{id}\">{}</at>", escape_html(person))
                }
                None => escape_html(person),
            })
            .collect();

        let related = if people.is_empty() {
            String::new()
        } else {
            format!("Related People: {}, ", people.join(" "))
        };

        content.push_str(&format!(
            "- {related}PID: {}, GPU Memory: {}, PWD: {}<br>-- Command: {}<br><br>",
            process.pid,
            escape_html(&process.gpu_memory),
            escape_html(process.pwd.as_deref().unwrap_or_default()),
            escape_html(process.cmd.as_deref().unwrap_or_default()),
        ));
    }

    ChatMessage {
        body: MessageBody {
            content_type: "html".to_string(),
            content,
        },
        mentions,
    }
}
