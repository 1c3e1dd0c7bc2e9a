use async_trait::async_trait;
use ctlchat::prelude::*;
use ctlchat::provider::TextStream;
use ctlchat::rag::{DocumentLoader, EmbedderError, Ingestor, MemoryStore};
use futures::StreamExt;
use std::sync::{Arc, Mutex};

/// Counts letters, so texts sharing words land close together.
struct LetterEmbedder;

#[async_trait]
impl EmbeddingFunction for LetterEmbedder {
    fn model_id(&self) -> &str {
        "letters"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut vector = vec![0.0; 26];
                for c in text.to_lowercase().chars().filter(|c| c.is_ascii_lowercase()) {
                    vector[(c as u8 - b'a') as usize] += 1.0;
                }
                vector
            })
            .collect())
    }
}

/// Echoes a fixed answer and remembers what it was asked.
#[derive(Default)]
struct RecordingProvider {
    requests: Mutex<Vec<ChatRequest>>,
}

#[async_trait]
impl Provider for RecordingProvider {
    async fn complete(&self, request: ChatRequest) -> Result<String, ProviderError> {
        self.requests.lock().unwrap().push(request);
        Ok("You get 15 days of PTO.".to_string())
    }

    async fn stream(&self, request: ChatRequest) -> Result<TextStream, ProviderError> {
        self.requests.lock().unwrap().push(request);
        let fragments = ["You get ", "15 days ", "of PTO."].map(|s| Ok(s.to_string()));
        Ok(futures::stream::iter(fragments).boxed())
    }
}

fn config() -> Config {
    let mut config = Config::default();
    config.llm.api_key = Some("sk-test".to_string());
    config.query.enhance = false;
    config.rag.embedding.dimension = 26;
    config
}

async fn setup() -> anyhow::Result<(Arc<RecordingProvider>, RagEngine)> {
    let config = config();
    let index = Arc::new(IndexStore::new(Arc::new(MemoryStore::new()), Arc::new(LetterEmbedder), 26));

    let ingestor = Ingestor::new(index.clone(), DocumentLoader::new(&config.rag));
    let report = ingestor
        .ingest_upload("pto.txt", b"Company X offers 15 days PTO.".to_vec(), Default::default())
        .await?;
    assert_eq!(report.chunks_added, 1);

    let provider = Arc::new(RecordingProvider::default());
    let engine = RagEngine::new(
        &config,
        provider.clone(),
        index,
        Arc::new(InMemoryConversationStore::new()),
    )?;
    Ok((provider, engine))
}

#[tokio::test]
async fn test_question_is_answered_from_ingested_document() -> anyhow::Result<()> {
    let (provider, engine) = setup().await?;

    let answer = engine
        .query("How much PTO do we get?", &QueryOptions::default())
        .await?;
    assert_eq!(answer.response, "You get 15 days of PTO.");
    assert_eq!(answer.sources.len(), 1);
    assert_eq!(answer.sources[0].source, "pto.txt");

    let requests = provider.requests.lock().unwrap();
    let user_turn = requests[0].last_user_message().unwrap_or_default();
    assert!(user_turn.contains("[Source 1: pto.txt]"));
    assert!(user_turn.contains("15 days PTO"));
    Ok(())
}

#[tokio::test]
async fn test_streamed_answer_reassembles() -> anyhow::Result<()> {
    let (_, engine) = setup().await?;

    let answer = engine.query_stream("PTO?", &QueryOptions::default()).await?;
    let mut text = String::new();
    let mut stream = answer.stream;
    while let Some(fragment) = stream.next().await {
        text.push_str(&fragment?);
    }
    assert_eq!(text, "You get 15 days of PTO.");
    Ok(())
}
