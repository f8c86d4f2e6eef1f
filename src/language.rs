//! Supported session languages and their starter templates.
//!
//! Switching a session's language always resets the document to the
//! template returned by [`Language::template`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::sync::SyncError;

/// Programming language of a session document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Javascript,
    Typescript,
    Python,
    Java,
    Cpp,
}

impl Language {
    /// Every language a session may be switched to
    pub const ALL: [Language; 5] = [
        Language::Javascript,
        Language::Typescript,
        Language::Python,
        Language::Java,
        Language::Cpp,
    ];

    /// Wire name of the language
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Javascript => "javascript",
            Language::Typescript => "typescript",
            Language::Python => "python",
            Language::Java => "java",
            Language::Cpp => "cpp",
        }
    }

    /// Starter code a session gets when created with, or switched to, this language
    pub fn template(&self) -> &'static str {
        match self {
            Language::Javascript => JAVASCRIPT_TEMPLATE,
            Language::Typescript => TYPESCRIPT_TEMPLATE,
            Language::Python => PYTHON_TEMPLATE,
            Language::Java => JAVA_TEMPLATE,
            Language::Cpp => CPP_TEMPLATE,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Language::ALL
            .iter()
            .copied()
            .find(|lang| lang.as_str() == wanted)
            .ok_or_else(|| SyncError::UnsupportedLanguage(s.to_string()))
    }
}

const JAVASCRIPT_TEMPLATE: &str = r#"// Welcome to the coding interview!
// Write your solution below

function solution(input) {
  // Your code here
  return input;
}

// Test your solution
console.log(solution("Hello, World!"));
"#;

const TYPESCRIPT_TEMPLATE: &str = r#"// Welcome to the coding interview!
// Write your solution below

function solution(input: string): string {
  // Your code here
  return input;
}

// Test your solution
console.log(solution("Hello, World!"));
"#;

const PYTHON_TEMPLATE: &str = r#"# Welcome to the coding interview!
# Write your solution below

def solution(input):
    # Your code here
    return input

# Test your solution
print(solution("Hello, World!"))
"#;

const JAVA_TEMPLATE: &str = r#"// Welcome to the coding interview!
// Write your solution below

public class Solution {
    public static String solution(String input) {
        // Your code here
        return input;
    }

    public static void main(String[] args) {
        System.out.println(solution("Hello, World!"));
    }
}
"#;

const CPP_TEMPLATE: &str = r#"// Welcome to the coding interview!
// Write your solution below

#include <iostream>
#include <string>

std::string solution(std::string input) {
    // Your code here
    return input;
}

int main() {
    std::cout << solution("Hello, World!") << std::endl;
    return 0;
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_language() {
        assert_eq!("python".parse::<Language>().unwrap(), Language::Python);
        assert_eq!(" CPP ".parse::<Language>().unwrap(), Language::Cpp);
    }

    #[test]
    fn test_unsupported_language() {
        let err = "cobol".parse::<Language>().unwrap_err();
        assert!(matches!(err, SyncError::UnsupportedLanguage(ref l) if l == "cobol"));
    }

    #[test]
    fn test_templates_match_language() {
        assert!(Language::Python.template().contains("def solution"));
        assert!(Language::Java.template().contains("public class Solution"));
        for lang in Language::ALL {
            assert!(!lang.template().is_empty());
        }
    }

    #[test]
    fn test_serde_lowercase() {
        let json = serde_json::to_string(&Language::Typescript).unwrap();
        assert_eq!(json, "\"typescript\"");
        let lang: Language = serde_json::from_str("\"java\"").unwrap();
        assert_eq!(lang, Language::Java);
    }

    #[test]
    fn test_default_is_javascript() {
        assert_eq!(Language::default(), Language::Javascript);
        assert_eq!(Language::default().as_str(), "javascript");
    }
}
