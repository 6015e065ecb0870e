use crate::workflow::state::CodeLocation;

/// Framework used for `language`; the configured one applies to Python.
pub fn framework_for<'a>(language: &str, configured: &'a str) -> &'a str {
    match language {
        "python" => configured,
        "javascript" | "typescript" => "jest",
        "go" => "the standard testing package",
        "java" => "JUnit 5",
        "rust" => "the built-in test harness",
        _ => configured,
    }
}

pub fn system_prompt(language: &str, framework: &str) -> String {
    format!(
        r#"You are an expert {language} developer writing unit tests with {framework}.

Write tests that:
1. Cover the happy path, edge cases and error handling
2. Use fixtures and mocks only where the code under test needs them
3. Have descriptive test names
4. Compile or import cleanly and are ready to run as-is

Output ONLY the complete test file. No explanations, no surrounding prose."#
    )
}

pub fn test_generation_prompt(location: &CodeLocation, source: &str, framework: &str) -> String {
    let language = &location.language;
    format!(
        r#"Generate unit tests for the following {language} source file.

File: {path}
Framework: {framework}
Current line coverage: {coverage:.1}%
Uncovered lines: {uncovered}

Source code:
```{language}
{source}
```

Focus on the code paths that are not exercised yet. Output the complete test file content."#,
        path = location.file_path,
        coverage = location.coverage,
        uncovered = location.uncovered_lines,
    )
}
