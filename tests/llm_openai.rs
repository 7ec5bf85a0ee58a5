use std::time::Duration;

use docent::llm::openai::OpenAiChatModel;
use docent::llm::{ChatMessage, ChatModel, ChatRequest, LlmError, StreamChunk};
use futures::StreamExt;
use httpmock::{Method::POST, MockServer};
use serde_json::json;

fn model(server: &MockServer) -> OpenAiChatModel {
    OpenAiChatModel::new(
        "gpt-4o",
        Some(&server.base_url()),
        Some("sk-test".to_string()),
        Duration::from_secs(5),
        0,
    )
    .unwrap()
}

#[tokio::test]
async fn test_complete_returns_text_and_tool_calls() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/chat/completions")
                .header("authorization", "Bearer sk-test")
                .body_contains("\"model\":\"gpt-4o\"");
            then.status(200).json_body(json!({
                "choices": [{
                    "message": {
                        "content": "Looking that up.",
                        "tool_calls": [{
                            "id": "call_1",
                            "type": "function",
                            "function": {"name": "search_documents", "arguments": "{\"query\":\"x\"}"}
                        }]
                    }
                }]
            }));
        })
        .await;

    let completion = model(&server)
        .complete(&ChatRequest::new(vec![ChatMessage::user("hi")]))
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(completion.content, "Looking that up.");
    assert_eq!(completion.tool_calls.len(), 1);
    assert_eq!(completion.tool_calls[0].name, "search_documents");
}

#[tokio::test]
async fn test_stream_yields_deltas() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/chat/completions")
                .body_contains("\"stream\":true");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(
                    "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n\
                     data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n\
                     data: [DONE]\n\n",
                );
        })
        .await;

    let stream = model(&server)
        .stream(&ChatRequest::new(vec![ChatMessage::user("hi")]))
        .await
        .unwrap();
    let chunks: Vec<StreamChunk> = stream.map(|c| c.unwrap()).collect().await;
    assert_eq!(
        chunks,
        vec![
            StreamChunk::TextDelta("Hel".to_string()),
            StreamChunk::TextDelta("lo".to_string())
        ]
    );
}

#[tokio::test]
async fn test_client_error_not_retried() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(400).body("bad request");
        })
        .await;

    let client = OpenAiChatModel::new(
        "gpt-4o",
        Some(&server.base_url()),
        None,
        Duration::from_secs(5),
        3,
    )
    .unwrap();
    let err = client
        .complete(&ChatRequest::new(vec![ChatMessage::user("hi")]))
        .await
        .unwrap_err();

    assert!(matches!(err, LlmError::Api { status: 400, .. }));
    assert_eq!(mock.hits_async().await, 1);
}
