//! crates/ecokids_core/src/chat/tools.rs
//!
//! Tools the assistant may call while it streams a reply.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::ports::{ChatTool, PortError, PortResult, StoryNavigator, StorySearch, ToolSpec};

fn parse_args<T: for<'de> Deserialize<'de>>(tool: &str, arguments: Value) -> PortResult<T> {
    serde_json::from_value(arguments)
        .map_err(|e| PortError::Unexpected(format!("Invalid arguments for {}: {}", tool, e)))
}

//=========================================================================================
// search_stories
//=========================================================================================

/// Finds stories whose content is similar to a free-text query.
pub struct StorySearchTool {
    search: Arc<dyn StorySearch>,
    limit: usize,
}

impl StorySearchTool {
    pub const NAME: &'static str = "search_stories";

    pub fn new(search: Arc<dyn StorySearch>, limit: usize) -> Self {
        Self { search, limit }
    }
}

#[derive(Deserialize)]
struct SearchArgs {
    query: String,
}

#[async_trait]
impl ChatTool for StorySearchTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: Self::NAME.to_string(),
            description: "Search the story library for stories about a topic.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "What the child is looking for." }
                },
                "required": ["query"]
            }),
        }
    }

    async fn call(&self, arguments: Value) -> PortResult<Value> {
        let args: SearchArgs = parse_args(Self::NAME, arguments)?;
        let matches = self.search.search(&args.query, self.limit).await?;
        info!(query = %args.query, found = matches.len(), "Story search ran.");
        Ok(Value::Array(
            matches
                .into_iter()
                .map(|m| {
                    json!({
                        "story_id": m.story_id,
                        "title": m.title,
                        "excerpt": m.content,
                        "similarity": m.similarity,
                    })
                })
                .collect(),
        ))
    }
}

//=========================================================================================
// open_story
//=========================================================================================

/// Opens a story screen on the child's device.
pub struct OpenStoryTool {
    navigator: Arc<dyn StoryNavigator>,
}

impl OpenStoryTool {
    pub const NAME: &'static str = "open_story";

    pub fn new(navigator: Arc<dyn StoryNavigator>) -> Self {
        Self { navigator }
    }
}

#[derive(Deserialize)]
struct OpenArgs {
    story_id: Uuid,
}

#[async_trait]
impl ChatTool for OpenStoryTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: Self::NAME.to_string(),
            description: "Open a story so the child can start reading it.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "story_id": { "type": "string", "format": "uuid" }
                },
                "required": ["story_id"]
            }),
        }
    }

    async fn call(&self, arguments: Value) -> PortResult<Value> {
        let args: OpenArgs = parse_args(Self::NAME, arguments)?;
        self.navigator.open_story(args.story_id);
        Ok(json!({ "opened": args.story_id }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::StoryMatch;
    use std::sync::Mutex;

    struct OneStory(Uuid);

    #[async_trait]
    impl StorySearch for OneStory {
        async fn search(&self, query: &str, limit: usize) -> PortResult<Vec<StoryMatch>> {
            assert_eq!(limit, 2);
            Ok(vec![StoryMatch {
                story_id: self.0,
                title: "The Little Turtle".to_string(),
                content: format!("A story about {query}."),
                similarity: 0.91,
            }])
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Uuid>>);

    impl StoryNavigator for Recorder {
        fn open_story(&self, story_id: Uuid) {
            self.0.lock().unwrap().push(story_id);
        }
    }

    #[tokio::test]
    async fn search_returns_excerpts() {
        let id = Uuid::new_v4();
        let tool = StorySearchTool::new(Arc::new(OneStory(id)), 2);
        let result = tool.call(json!({ "query": "sea turtles" })).await.unwrap();
        assert_eq!(result[0]["story_id"], json!(id));
        assert_eq!(result[0]["excerpt"], "A story about sea turtles.");
    }

    #[tokio::test]
    async fn open_story_navigates_and_rejects_bad_ids() {
        let recorder = Arc::new(Recorder::default());
        let tool = OpenStoryTool::new(recorder.clone());
        let id = Uuid::new_v4();
        tool.call(json!({ "story_id": id })).await.unwrap();
        assert_eq!(*recorder.0.lock().unwrap(), vec![id]);

        let err = tool.call(json!({ "story_id": "not-a-uuid" })).await.unwrap_err();
        assert!(matches!(err, PortError::Unexpected(_)));
    }
}
