//! Skill vocabulary: language detection from file paths and canonical names
//! for languages and technologies mentioned in labels.

use std::path::Path;

use crate::domain::SkillCategory;

/// Fixed skill fed by every message.
pub const COLLABORATION_SKILL: &str = "Collaboration";
/// Fixed skill fed by every issue.
pub const ISSUE_TRACKING_SKILL: &str = "Issue Tracking";

const LANGUAGE_ALIASES: &[(&str, &str)] = &[
    ("rust", "Rust"),
    ("go", "Go"),
    ("golang", "Go"),
    ("python", "Python"),
    ("py", "Python"),
    ("javascript", "JavaScript"),
    ("js", "JavaScript"),
    ("typescript", "TypeScript"),
    ("ts", "TypeScript"),
    ("java", "Java"),
    ("kotlin", "Kotlin"),
    ("swift", "Swift"),
    ("c", "C"),
    ("c++", "C++"),
    ("cpp", "C++"),
    ("c#", "C#"),
    ("csharp", "C#"),
    ("ruby", "Ruby"),
    ("php", "PHP"),
    ("scala", "Scala"),
    ("elixir", "Elixir"),
    ("haskell", "Haskell"),
    ("shell", "Shell"),
    ("bash", "Shell"),
    ("sql", "SQL"),
    ("html", "HTML"),
    ("css", "CSS"),
    ("dart", "Dart"),
];

const EXTENSIONS: &[(&str, &str)] = &[
    ("rs", "Rust"),
    ("go", "Go"),
    ("py", "Python"),
    ("js", "JavaScript"),
    ("jsx", "JavaScript"),
    ("mjs", "JavaScript"),
    ("ts", "TypeScript"),
    ("tsx", "TypeScript"),
    ("java", "Java"),
    ("kt", "Kotlin"),
    ("swift", "Swift"),
    ("c", "C"),
    ("h", "C"),
    ("cc", "C++"),
    ("cpp", "C++"),
    ("hpp", "C++"),
    ("cs", "C#"),
    ("rb", "Ruby"),
    ("php", "PHP"),
    ("scala", "Scala"),
    ("ex", "Elixir"),
    ("exs", "Elixir"),
    ("hs", "Haskell"),
    ("sh", "Shell"),
    ("sql", "SQL"),
    ("html", "HTML"),
    ("css", "CSS"),
    ("scss", "CSS"),
    ("dart", "Dart"),
];

const TECHNOLOGIES: &[(&str, &str)] = &[
    ("kubernetes", "Kubernetes"),
    ("k8s", "Kubernetes"),
    ("docker", "Docker"),
    ("terraform", "Terraform"),
    ("aws", "AWS"),
    ("gcp", "Google Cloud"),
    ("azure", "Azure"),
    ("postgres", "PostgreSQL"),
    ("postgresql", "PostgreSQL"),
    ("mysql", "MySQL"),
    ("redis", "Redis"),
    ("kafka", "Kafka"),
    ("graphql", "GraphQL"),
    ("react", "React"),
    ("vue", "Vue"),
    ("angular", "Angular"),
    ("django", "Django"),
    ("rails", "Ruby on Rails"),
    ("spring", "Spring"),
    ("elasticsearch", "Elasticsearch"),
];

/// Canonical spelling of a language name; unknown languages keep their
/// trimmed spelling.
pub fn canonical_language(name: &str) -> String {
    let trimmed = name.trim();
    let lower = trimmed.to_ascii_lowercase();
    LANGUAGE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == lower)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or_else(|| trimmed.to_string())
}

pub fn language_for_path(path: &str) -> Option<&'static str> {
    let ext = Path::new(path).extension()?.to_str()?.to_ascii_lowercase();
    EXTENSIONS
        .iter()
        .find(|(known, _)| *known == ext)
        .map(|(_, language)| *language)
}

/// Resolves a label or component that names a known technology or language.
pub fn skill_for_label(label: &str) -> Option<(&'static str, SkillCategory)> {
    let lower = label.trim().to_ascii_lowercase();
    if let Some((_, tech)) = TECHNOLOGIES.iter().find(|(alias, _)| *alias == lower) {
        return Some((tech, SkillCategory::Technology));
    }
    LANGUAGE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == lower)
        .map(|(_, language)| (*language, SkillCategory::Language))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn languages_from_paths() {
        assert_eq!(language_for_path("src/main.rs"), Some("Rust"));
        assert_eq!(language_for_path("web/App.TSX"), Some("TypeScript"));
        assert_eq!(language_for_path("README.md"), None);
        assert_eq!(language_for_path("Makefile"), None);
    }

    #[test]
    fn canonical_names() {
        assert_eq!(canonical_language(" golang "), "Go");
        assert_eq!(canonical_language("Zig"), "Zig");
        assert_eq!(
            skill_for_label("K8s"),
            Some(("Kubernetes", SkillCategory::Technology))
        );
        assert_eq!(
            skill_for_label("python"),
            Some(("Python", SkillCategory::Language))
        );
        assert_eq!(skill_for_label("bug"), None);
    }
}
