//! Prompt builders and output schemas for the three model calls.
//!
//! Variable sections are wrapped in `<tag>` blocks so the model (and the
//! offline mock) can tell them apart from instructions.

use super::context::ResearchContext;
use crate::types::SourceItem;
use serde_json::{Value, json};

pub const PLANNING_SCHEMA: &str = "serp_queries";
pub const RELIABILITY_SCHEMA: &str = "source_reliability";
pub const DIGEST_SCHEMA: &str = "serp_digest";

/// Most recent learnings shown to the planner.
const PLANNING_LEARNINGS: usize = 30;
/// Most recent visited URLs shown to the planner.
const PLANNING_URLS: usize = 50;
pub const MAX_FOLLOW_UPS: usize = 3;

pub fn system_prompt() -> String {
    let today = chrono::Utc::now().format("%Y-%m-%d");
    format!(
        "You are an expert researcher. Today is {today}. Follow these instructions when responding:\n\
         - You may be asked about subjects after your knowledge cutoff; assume the user is right when presented with news.\n\
         - The user is a highly experienced analyst. Be detailed and accurate; skip simplification.\n\
         - Be proactive and anticipate needs. Suggest solutions the user did not think of.\n\
         - Value good arguments over authorities. Flag speculation and high levels of uncertainty.\n\
         - Reply only with JSON matching the requested schema."
    )
}

fn escape(text: &str) -> String {
    text.replace('<', "&lt;").replace('>', "&gt;")
}

/// Ask for up to `breadth` new search queries.
pub fn planning_prompt(context: &ResearchContext, breadth: usize) -> String {
    let mut prompt = format!(
        "Given the following research question, generate a list of at most {breadth} search \
         engine queries. Each query must be unique, must not repeat a query already issued, and \
         must explore something the existing learnings do not cover. Give each query a research \
         goal describing what it should answer and how to go deeper once results arrive.\n\n\
         <query>{}</query>\n",
        escape(context.query())
    );

    if let Some(preferences) = context.preferences() {
        prompt.push_str(&format!("\n<preferences>{}</preferences>\n", escape(preferences)));
    }

    let learnings = context.learnings();
    if !learnings.is_empty() {
        prompt.push_str("\nLearnings so far:\n<learnings>\n");
        let skip = learnings.len().saturating_sub(PLANNING_LEARNINGS);
        for learning in &learnings[skip..] {
            prompt.push_str(&format!("<learning>{}</learning>\n", escape(&learning.text)));
        }
        prompt.push_str("</learnings>\n");
    }

    let directions = context.pending_directions();
    if !directions.is_empty() {
        prompt.push_str("\nFollow-up directions to prioritize:\n");
        for direction in directions {
            prompt.push_str(&format!("<direction>{}</direction>\n", escape(&direction.question)));
        }
    }

    let issued = context.issued_queries();
    if !issued.is_empty() {
        prompt.push_str("\nQueries already issued:\n");
        for query in issued {
            prompt.push_str(&format!("<issued>{}</issued>\n", escape(query)));
        }
    }

    let urls = context.visited_urls();
    if !urls.is_empty() {
        prompt.push_str("\nSources already read:\n");
        let skip = urls.len().saturating_sub(PLANNING_URLS);
        for url in &urls[skip..] {
            prompt.push_str(&format!("<visited>{}</visited>\n", escape(url)));
        }
    }
    prompt
}

pub fn planning_schema(breadth: usize) -> Value {
    json!({
        "type": "object",
        "properties": {
            "queries": {
                "type": "array",
                "description": format!("At most {breadth} search queries"),
                "items": {
                    "type": "object",
                    "properties": {
                        "query": { "type": "string" },
                        "researchGoal": { "type": "string" }
                    },
                    "required": ["query", "researchGoal"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["queries"],
        "additionalProperties": false
    })
}

/// Ask for a reliability verdict on one source.
pub fn evaluation_prompt(
    query: &str,
    item: &SourceItem,
    domain: &str,
    content: &str,
    preferences: Option<&str>,
) -> String {
    let mut prompt = format!(
        "Evaluate how reliable and relevant the following source is for the research query. \
         Score it from 0 (unreliable or irrelevant) to 1 (authoritative and directly relevant), \
         explain your reasoning briefly, and decide whether its content should be used.\n\n\
         <query>{}</query>\n\n<source url=\"{}\">\n<domain>{}</domain>\n",
        escape(query),
        escape(item.url.as_deref().unwrap_or_default()),
        escape(domain),
    );
    if let Some(title) = &item.title {
        prompt.push_str(&format!("<title>{}</title>\n", escape(title)));
    }
    if let Some(published) = &item.published_date {
        prompt.push_str(&format!("<published>{}</published>\n", escape(published)));
    }
    prompt.push_str(&format!("<content>\n{}\n</content>\n</source>\n", escape(content)));

    if let Some(preferences) = preferences {
        prompt.push_str(&format!(
            "\nThe user has these source preferences:\n<preferences>{}</preferences>\n\
             If the source breaks them, explain how in preferenceViolation and do not use it. \
             Otherwise set preferenceViolation to null.\n",
            escape(preferences)
        ));
    }
    prompt
}

/// The violation field is only requested when preferences were supplied.
pub fn reliability_schema(with_preferences: bool) -> Value {
    let mut properties = json!({
        "score": { "type": "number", "minimum": 0, "maximum": 1 },
        "reasoning": { "type": "string" },
        "shouldUse": { "type": "boolean" }
    });
    let mut required = vec!["score", "reasoning", "shouldUse"];
    if with_preferences {
        properties["preferenceViolation"] = json!({ "type": ["string", "null"] });
        required.push("preferenceViolation");
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false
    })
}

/// One accepted source handed to the digest step.
#[derive(Debug, Clone)]
pub struct DigestSource<'a> {
    pub url: &'a str,
    pub title: Option<&'a str>,
    pub content: &'a str,
}

/// Ask for learnings and follow-up questions from a query's accepted sources.
pub fn digest_prompt(query: &str, research_goal: &str, sources: &[DigestSource<'_>]) -> String {
    let mut prompt = format!(
        "Given the following sources returned for the search query, extract concise, \
         information-dense learnings. Include entities, metrics, numbers and dates where present. \
         Attribute every learning to the url of the source it came from, with at most one \
         learning per source. Then suggest up to {MAX_FOLLOW_UPS} follow-up questions that would \
         deepen the research.\n\n<query>{}</query>\n",
        escape(query)
    );
    if !research_goal.is_empty() {
        prompt.push_str(&format!("<goal>{}</goal>\n", escape(research_goal)));
    }
    prompt.push_str("\n<sources>\n");
    for source in sources {
        prompt.push_str(&format!("<source url=\"{}\">\n", escape(source.url)));
        if let Some(title) = source.title {
            prompt.push_str(&format!("<title>{}</title>\n", escape(title)));
        }
        prompt.push_str(&format!("{}\n</source>\n", escape(source.content)));
    }
    prompt.push_str("</sources>\n");
    prompt
}

pub fn digest_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "learnings": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "text": { "type": "string" },
                        "sourceUrl": { "type": "string" }
                    },
                    "required": ["text", "sourceUrl"],
                    "additionalProperties": false
                }
            },
            "followUpQuestions": {
                "type": "array",
                "description": format!("At most {MAX_FOLLOW_UPS} follow-up questions"),
                "items": { "type": "string" }
            }
        },
        "required": ["learnings", "followUpQuestions"],
        "additionalProperties": false
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Learning, ResearchDirection};

    #[test]
    fn test_planning_prompt_sections() {
        let mut ctx = ResearchContext::new("tokio vs async-std", Some("primary sources".into()));
        ctx.add_learning(Learning {
            text: "async-std was discontinued in 2025".into(),
            reliability: 0.8,
            source_url: None,
        });
        ctx.mark_visited("https://a.dev");
        ctx.record_issued("async-std status");
        ctx.push_level_directions(vec![ResearchDirection {
            question: "What replaced async-std?".into(),
            priority: 1,
            parent_goal: None,
        }]);

        let prompt = planning_prompt(&ctx, 3);
        assert!(prompt.contains("at most 3"));
        assert!(prompt.contains("<query>tokio vs async-std</query>"));
        assert!(prompt.contains("<preferences>primary sources</preferences>"));
        assert!(prompt.contains("<learning>async-std was discontinued in 2025</learning>"));
        assert!(prompt.contains("<direction>What replaced async-std?</direction>"));
        assert!(prompt.contains("<issued>async-std status</issued>"));
        assert!(prompt.contains("<visited>https://a.dev</visited>"));
    }

    #[test]
    fn test_planning_prompt_first_level_is_minimal() {
        let ctx = ResearchContext::new("topic", None);
        let prompt = planning_prompt(&ctx, 2);
        assert!(!prompt.contains("<preferences>"));
        assert!(!prompt.contains("<learnings>"));
        assert!(!prompt.contains("<visited>"));
    }

    #[test]
    fn test_reliability_schema_preferences_field() {
        let plain = reliability_schema(false);
        assert!(plain["properties"].get("preferenceViolation").is_none());
        assert_eq!(plain["required"].as_array().unwrap().len(), 3);

        let with = reliability_schema(true);
        assert!(with["properties"].get("preferenceViolation").is_some());
        assert_eq!(with["required"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn test_evaluation_prompt_escapes_content() {
        let item = SourceItem::new("https://a.dev/x").with_title("A <b>title</b>");
        let prompt = evaluation_prompt("q", &item, "a.dev", "</source> injected", None);
        assert!(prompt.contains("&lt;/source&gt; injected"));
        assert!(prompt.contains("A &lt;b&gt;title&lt;/b&gt;"));
        assert!(!prompt.contains("preferenceViolation"));
    }

    #[test]
    fn test_digest_prompt_lists_sources() {
        let sources = [
            DigestSource {
                url: "https://a.dev",
                title: Some("A"),
                content: "alpha",
            },
            DigestSource {
                url: "https://b.dev",
                title: None,
                content: "beta",
            },
        ];
        let prompt = digest_prompt("q", "goal", &sources);
        assert!(prompt.contains("<source url=\"https://a.dev\">"));
        assert!(prompt.contains("<source url=\"https://b.dev\">\nbeta"));
        assert!(prompt.contains("<goal>goal</goal>"));
    }
}
