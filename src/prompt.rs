//! Extraction and repair instructions, one pair per topic.

use std::sync::LazyLock;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::records::{FacultyMember, GroupMember, ScholarProfile};
use crate::store::Topic;

/// Expected payload layout inside the model's fenced block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// A single JSON object.
    Object,
    /// One JSON object per line.
    Lines,
}

#[derive(Debug)]
pub struct Schema {
    pub topic: Topic,
    pub shape: Shape,
    pub extract: String,
    pub repair: String,
    /// Whether one record has the types of the topic's record struct.
    pub check: fn(&Value) -> Result<(), String>,
}

fn conforms<T: DeserializeOwned>(record: &Value) -> Result<(), String> {
    T::deserialize(record).map(drop).map_err(|e| e.to_string())
}

const NO_FABRICATION: &str = "Note that the data in the example above is not real, replace it with the real data you find. \
Find as much information as possible, but if some information is missing leave the field empty or omit it. \
Never make up values and never write placeholders such as \"N/A\" or \"unknown\".";

const FACULTY_INTERFACE: &str = r#"```typescript
interface FacultyMember {
    name: string;
    title?: string;         // e.g. Professor, Associate Professor, Assistant Professor, Lecturer, Engineer
    email?: string;
    introduction?: string;  // research interests, experience, etc.
    profile_url?: string;   // link to the member's detailed profile
}
```"#;

const FACULTY_EXAMPLE: &str = r#"```json
{"name": "Alice", "title": "Associate Professor", "profile_url": "https://example.org/alice", "email": "alice@example.org", "introduction": "research interests include catalysis"}
{"name": "Bob", "title": "Professor", "profile_url": "https://example.org/bob"}
```"#;

const CV_INTERFACE: &str = r#"```typescript
interface Experience {
    start_year?: string;
    end_year?: string;      // empty if ongoing
    title?: string;         // e.g. PhD student, Postdoc, Assistant Professor
    institute?: string;
    department?: string;
    group?: string;         // research group or advisor
}

interface ScholarProfile {
    name: string;
    title?: string;
    email?: string;
    institute?: string;
    department?: string;
    homepage?: string;
    research_interests?: string[];
    education?: Experience[];
    experiences?: Experience[];
    publications?: string[];  // one citation string per item
}
```"#;

const CV_EXAMPLE: &str = r#"```json
{"name": "Alice", "title": "Assistant Professor", "institute": "Example University", "education": [{"start_year": "2012", "end_year": "2017", "title": "PhD", "institute": "Another University"}], "experiences": [{"start_year": "2017", "end_year": "2020", "title": "Postdoc", "institute": "Example Lab"}]}
```"#;

const GROUP_INTERFACE: &str = r#"```typescript
interface GroupMember {
    name: string;
    title?: string;         // e.g. PhD student, Master student, Postdoc, Research Assistant
    email?: string;
    profile_url?: string;
    start_year?: string;
    end_year?: string;
    is_alumni?: boolean;
}
```"#;

const GROUP_EXAMPLE: &str = r#"```json
{"name": "Carol", "title": "PhD student", "start_year": "2021"}
{"name": "Dave", "title": "Postdoc", "is_alumni": true, "end_year": "2022"}
```"#;

fn extract_prompt(what: &str, interface: &str, shape: Shape, example: &str) -> String {
    let layout = match shape {
        Shape::Lines => format!(
            "The document may describe several {what}. Serialize every object you find as one line of JSON \
             (JSON Lines) and put all lines in a single json code block, for example:"
        ),
        Shape::Object => "Serialize the object as a single JSON object and put it in a json code block, for example:".to_string(),
    };
    format!(
        "Your job is to retrieve information about {what} from a markdown document.\n\n\
         The object is defined by the following TypeScript interface:\n\n{interface}\n\n\
         {layout}\n{example}\n\n{NO_FABRICATION}"
    )
}

fn repair_prompt(what: &str, interface: &str, shape: Shape, example: &str) -> String {
    let layout = match shape {
        Shape::Lines => "one JSON object per line",
        Shape::Object => "a single JSON object",
    };
    format!(
        "Your job is to fix invalid JSON that should contain information about {what}.\n\
         Valid output must respect the following TypeScript interface:\n\n{interface}\n\n\
         Produce {layout} in a json code block, for example:\n{example}\n\n{NO_FABRICATION}"
    )
}

fn build(topic: Topic) -> Schema {
    let (what, interface, shape, example, check): (_, _, _, _, fn(&Value) -> Result<(), String>) = match topic {
        Topic::Faculty => ("faculty members", FACULTY_INTERFACE, Shape::Lines, FACULTY_EXAMPLE, conforms::<FacultyMember>),
        Topic::Cv => ("a scholar's CV", CV_INTERFACE, Shape::Object, CV_EXAMPLE, conforms::<ScholarProfile>),
        Topic::Group => ("research group members", GROUP_INTERFACE, Shape::Lines, GROUP_EXAMPLE, conforms::<GroupMember>),
    };
    Schema {
        topic,
        shape,
        check,
        extract: extract_prompt(what, interface, shape, example),
        repair: repair_prompt(what, interface, shape, example),
    }
}

static FACULTY: LazyLock<Schema> = LazyLock::new(|| build(Topic::Faculty));
static CV: LazyLock<Schema> = LazyLock::new(|| build(Topic::Cv));
static GROUP: LazyLock<Schema> = LazyLock::new(|| build(Topic::Group));

pub fn schema(topic: Topic) -> &'static Schema {
    match topic {
        Topic::Faculty => &FACULTY,
        Topic::Cv => &CV,
        Topic::Group => &GROUP,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompts_embed_interface_and_shape() {
        let s = schema(Topic::Faculty);
        assert_eq!(s.shape, Shape::Lines);
        assert!(s.extract.contains("interface FacultyMember"));
        assert!(s.extract.contains("JSON Lines"));
        assert!(s.repair.starts_with("Your job is to fix invalid JSON"));

        let cv = schema(Topic::Cv);
        assert_eq!(cv.shape, Shape::Object);
        assert!(cv.extract.contains("interface ScholarProfile"));
        assert_ne!(cv.extract, cv.repair);
    }

    #[test]
    fn check_follows_record_types() {
        let cv = schema(Topic::Cv);
        assert!((cv.check)(&serde_json::json!({"name": "A", "research_interests": ["x"]})).is_ok());
        assert!((cv.check)(&serde_json::json!({"name": "A", "research_interests": "x"})).is_err());
        assert!((schema(Topic::Group).check)(&serde_json::json!({"name": "A", "is_alumni": "yes"})).is_err());
    }
}
