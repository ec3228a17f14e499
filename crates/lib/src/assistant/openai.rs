//! OpenAI Assistants API client (https://api.openai.com/v1 by default).
//! Threads, messages and runs for the relay; files and assistants for provisioning.

use super::{AssistantBackend, AssistantError, Run};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::path::Path;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const ASSISTANTS_BETA_HEADER: &str = "assistants=v2";

/// Client for the OpenAI Assistants HTTP API.
#[derive(Clone)]
pub struct OpenAiAssistants {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

/// Any created object; only the id is read back.
#[derive(Debug, Deserialize)]
struct CreatedObject {
    id: String,
}

/// Assistant to create with [`OpenAiAssistants::create_assistant`].
#[derive(Debug, Clone)]
pub struct NewAssistant {
    pub name: String,
    pub instructions: String,
    pub model: String,
    /// Uploaded file ids made searchable through the file_search tool.
    pub file_ids: Vec<String>,
}

impl NewAssistant {
    fn body(&self) -> serde_json::Value {
        let mut body = json!({
            "name": self.name,
            "instructions": self.instructions,
            "model": self.model,
            "tools": [{ "type": "file_search" }],
        });
        if !self.file_ids.is_empty() {
            body["tool_resources"] = json!({
                "file_search": { "vector_stores": [{ "file_ids": self.file_ids }] }
            });
        }
        body
    }
}

#[derive(Debug, Deserialize)]
struct MessageList {
    #[serde(default)]
    data: Vec<ThreadMessage>,
}

#[derive(Debug, Deserialize)]
struct ThreadMessage {
    #[serde(default)]
    content: Vec<MessageContent>,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    #[serde(rename = "type", default)]
    typ: String,
    #[serde(default)]
    text: Option<TextContent>,
}

#[derive(Debug, Deserialize)]
struct TextContent {
    value: String,
}

impl OpenAiAssistants {
    pub fn new(base_url: Option<String>, api_key: impl Into<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url,
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    fn post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", ASSISTANTS_BETA_HEADER)
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .get(url)
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", ASSISTANTS_BETA_HEADER)
    }

    /// POST /files with purpose=assistants; returns the file id.
    pub async fn upload_file(&self, path: &Path) -> Result<String, AssistantError> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|source| AssistantError::File {
                path: path.to_path_buf(),
                source,
            })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let form = reqwest::multipart::Form::new()
            .text("purpose", "assistants")
            .part(
                "file",
                reqwest::multipart::Part::bytes(data).file_name(file_name),
            );
        let url = format!("{}/files", self.base_url);
        let res = check(self.post(&url).multipart(form).send().await?).await?;
        let file: CreatedObject = res.json().await?;
        log::info!("assistant: uploaded {} as {}", path.display(), file.id);
        Ok(file.id)
    }

    /// POST /assistants; returns the assistant id.
    pub async fn create_assistant(&self, assistant: &NewAssistant) -> Result<String, AssistantError> {
        let url = format!("{}/assistants", self.base_url);
        let res = check(self.post(&url).json(&assistant.body()).send().await?).await?;
        let created: CreatedObject = res.json().await?;
        log::info!("assistant: created {} ({})", assistant.name, created.id);
        Ok(created.id)
    }
}

/// Turn a non-2xx response into `AssistantError::Api` with the body for logging.
async fn check(res: reqwest::Response) -> Result<reqwest::Response, AssistantError> {
    if !res.status().is_success() {
        let status = res.status().as_u16();
        let body = res.text().await.unwrap_or_default();
        return Err(AssistantError::Api { status, body });
    }
    Ok(res)
}

#[async_trait]
impl AssistantBackend for OpenAiAssistants {
    /// POST /threads
    async fn create_thread(&self) -> Result<String, AssistantError> {
        let url = format!("{}/threads", self.base_url);
        let res = check(self.post(&url).json(&json!({})).send().await?).await?;
        let thread: CreatedObject = res.json().await?;
        Ok(thread.id)
    }

    /// POST /threads/{thread_id}/messages
    async fn add_user_message(&self, thread_id: &str, text: &str) -> Result<(), AssistantError> {
        let url = format!("{}/threads/{}/messages", self.base_url, thread_id);
        let body = json!({ "role": "user", "content": text });
        check(self.post(&url).json(&body).send().await?).await?;
        Ok(())
    }

    /// POST /threads/{thread_id}/runs
    async fn create_run(&self, thread_id: &str, assistant_id: &str) -> Result<Run, AssistantError> {
        let url = format!("{}/threads/{}/runs", self.base_url, thread_id);
        let body = json!({ "assistant_id": assistant_id });
        let res = check(self.post(&url).json(&body).send().await?).await?;
        Ok(res.json().await?)
    }

    /// GET /threads/{thread_id}/runs/{run_id}
    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> Result<Run, AssistantError> {
        let url = format!("{}/threads/{}/runs/{}", self.base_url, thread_id, run_id);
        let res = check(self.get(&url).send().await?).await?;
        Ok(res.json().await?)
    }

    /// GET /threads/{thread_id}/messages, newest first; returns the first text part.
    async fn latest_message_text(&self, thread_id: &str) -> Result<String, AssistantError> {
        let url = format!(
            "{}/threads/{}/messages?order=desc&limit=1",
            self.base_url, thread_id
        );
        let res = check(self.get(&url).send().await?).await?;
        let list: MessageList = res.json().await?;
        list.data
            .into_iter()
            .next()
            .and_then(|m| {
                m.content
                    .into_iter()
                    .find(|c| c.typ == "text")
                    .and_then(|c| c.text)
            })
            .map(|t| t.value)
            .ok_or_else(|| AssistantError::EmptyReply(thread_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::RunStatus;
    use wiremock::matchers::{body_json, body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn create_thread_sends_auth_and_beta_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/threads"))
            .and(header("authorization", "Bearer sk-test"))
            .and(header("openai-beta", "assistants=v2"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "id": "thread_abc", "object": "thread" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = OpenAiAssistants::new(Some(server.uri()), "sk-test");
        assert_eq!(client.create_thread().await.unwrap(), "thread_abc");
    }

    #[tokio::test]
    async fn add_user_message_posts_role_and_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/threads/thread_abc/messages"))
            .and(body_json(json!({ "role": "user", "content": "hello" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "msg_1" })))
            .expect(1)
            .mount(&server)
            .await;

        let client = OpenAiAssistants::new(Some(server.uri()), "sk-test");
        client.add_user_message("thread_abc", "hello").await.unwrap();
    }

    #[tokio::test]
    async fn create_and_retrieve_run() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/threads/thread_abc/runs"))
            .and(body_json(json!({ "assistant_id": "asst_1" })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "id": "run_1", "status": "queued" })),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/threads/thread_abc/runs/run_1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "id": "run_1", "status": "completed" })),
            )
            .mount(&server)
            .await;

        let client = OpenAiAssistants::new(Some(server.uri()), "sk-test");
        let run = client.create_run("thread_abc", "asst_1").await.unwrap();
        assert_eq!(run.status, RunStatus::Queued);
        let run = client.retrieve_run("thread_abc", &run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn latest_message_text_reads_first_text_part() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/threads/thread_abc/messages"))
            .and(query_param("order", "desc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{
                    "id": "msg_2",
                    "role": "assistant",
                    "content": [
                        { "type": "image_file", "image_file": { "file_id": "f1" } },
                        { "type": "text", "text": { "value": "Check-in is at 3pm.", "annotations": [] } }
                    ]
                }]
            })))
            .mount(&server)
            .await;

        let client = OpenAiAssistants::new(Some(server.uri()), "sk-test");
        assert_eq!(
            client.latest_message_text("thread_abc").await.unwrap(),
            "Check-in is at 3pm."
        );
    }

    #[tokio::test]
    async fn empty_message_list_is_empty_reply() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/threads/thread_abc/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
            .mount(&server)
            .await;

        let client = OpenAiAssistants::new(Some(server.uri()), "sk-test");
        let err = client.latest_message_text("thread_abc").await.unwrap_err();
        assert!(matches!(err, AssistantError::EmptyReply(ref id) if id == "thread_abc"));
    }

    #[tokio::test]
    async fn non_success_status_is_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/threads"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
            .mount(&server)
            .await;

        let client = OpenAiAssistants::new(Some(server.uri()), "bad");
        match client.create_thread().await.unwrap_err() {
            AssistantError::Api { status, body } => {
                assert_eq!(status, 401);
                assert!(body.contains("invalid api key"));
            }
            other => panic!("expected api error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn upload_file_sends_multipart_with_assistants_purpose() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/files"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_string_contains("assistants"))
            .and(body_string_contains("guide.txt"))
            .and(body_string_contains("Check-in is at 3pm."))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "id": "file_123", "object": "file" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = std::env::temp_dir().join(format!("threadline-upload-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("guide.txt");
        std::fs::write(&file, "Check-in is at 3pm.").unwrap();

        let client = OpenAiAssistants::new(Some(server.uri()), "sk-test");
        assert_eq!(client.upload_file(&file).await.unwrap(), "file_123");
    }

    #[tokio::test]
    async fn upload_missing_file_fails_before_any_request() {
        let server = MockServer::start().await;
        let client = OpenAiAssistants::new(Some(server.uri()), "sk-test");
        let missing = std::env::temp_dir().join(format!("threadline-missing-{}", uuid::Uuid::new_v4()));
        let err = client.upload_file(&missing).await.unwrap_err();
        assert!(matches!(err, AssistantError::File { .. }));
        assert_eq!(server.received_requests().await.map_or(0, |r| r.len()), 0);
    }

    #[tokio::test]
    async fn create_assistant_attaches_files_to_file_search() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/assistants"))
            .and(header("openai-beta", "assistants=v2"))
            .and(body_json(json!({
                "name": "Concierge",
                "instructions": "Answer tenant questions.",
                "model": "gpt-4o",
                "tools": [{ "type": "file_search" }],
                "tool_resources": {
                    "file_search": { "vector_stores": [{ "file_ids": ["file_123"] }] }
                }
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "id": "asst_new", "object": "assistant" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = OpenAiAssistants::new(Some(server.uri()), "sk-test");
        let id = client
            .create_assistant(&NewAssistant {
                name: "Concierge".to_string(),
                instructions: "Answer tenant questions.".to_string(),
                model: "gpt-4o".to_string(),
                file_ids: vec!["file_123".to_string()],
            })
            .await
            .unwrap();
        assert_eq!(id, "asst_new");
    }

    #[test]
    fn assistant_without_files_has_no_tool_resources() {
        let body = NewAssistant {
            name: "Concierge".to_string(),
            instructions: "hi".to_string(),
            model: "gpt-4o".to_string(),
            file_ids: Vec::new(),
        }
        .body();
        assert!(body.get("tool_resources").is_none());
        assert_eq!(body["tools"][0]["type"], "file_search");
    }
}
