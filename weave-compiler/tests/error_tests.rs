//! Error message tests
//!
//! These tests verify that the compiler reports the right diagnostic codes,
//! positions and help text for malformed workflows.

use weave_compiler::{Compiler, CompileError, Diagnostic, DiagnosticCode};

fn validate(source: &str) -> Vec<Diagnostic> {
    Compiler::default().validate(source, "test.wv")
}

fn codes(source: &str) -> Vec<DiagnosticCode> {
    validate(source).iter().map(|d| d.code).collect()
}

const PRELUDE: &str = "model main = \"anthropic/claude\"\nprompt p: \"Answer $input\"\n";

// =============================================================================
// Syntax Error Tests
// =============================================================================

#[test]
fn test_invalid_token() {
    let diags = validate("agent @helper:\n    instruction p\n");
    assert_eq!(diags.len(), 1);
    assert_eq!(diags[0].code, DiagnosticCode::E0007);
    assert_eq!((diags[0].line, diags[0].column), (1, 7));
}

#[test]
fn test_unclosed_string() {
    let diags = validate("model main = \"anthropic/claude\n");
    assert_eq!(diags[0].code, DiagnosticCode::E0007);
}

#[test]
fn test_missing_colon() {
    let diags = validate("flow main\n    return 1\n");
    assert_eq!(diags[0].code, DiagnosticCode::E0007);
    assert_eq!(diags[0].line, 1);
    assert!(diags[0].message.contains("expected"), "{}", diags[0].message);
}

#[test]
fn test_mismatched_indentation() {
    let source = "flow main:\n    loop do\n        continue\n      end\n";
    let diags = validate(source);
    assert_eq!(diags.len(), 1);
    assert_eq!(diags[0].code, DiagnosticCode::E0008);
    assert_eq!((diags[0].line, diags[0].column), (4, 7));
}

#[test]
fn test_syntax_error_stops_compilation() {
    let err = Compiler::default()
        .compile("flow main:\nreturn 1\n", "test.wv")
        .unwrap_err();
    assert!(matches!(err, CompileError::Syntax(_)));
}

// =============================================================================
// Semantic Error Tests
// =============================================================================

#[test]
fn test_undefined_agent_suggests_candidates() {
    let source = format!(
        "{PRELUDE}agent reviewer:\n    instruction p\nagent fixer:\n    instruction p\nflow main:\n    $r = run agent reveiwer with $input\n    return $r\n"
    );
    let diags = validate(&source);
    assert_eq!(diags.len(), 1);
    assert_eq!(diags[0].code, DiagnosticCode::E0001);
    assert_eq!(diags[0].message, "undefined agent 'reveiwer'");
    assert_eq!(
        diags[0].help.as_deref(),
        Some("did you mean 'reviewer'? defined agents are: fixer, reviewer")
    );
}

#[test]
fn test_undefined_references_of_every_kind() {
    let source = format!(
        "{PRELUDE}prompt q expecting Missing using model nope: \"x\"\nagent a:\n    instruction p\n    tools ghost\n    retry never\n    timeout later\nflow main:\n    $x = run flow other\n    $y = call llm nothing\n    return $x\n"
    );
    let diags = validate(&source);
    let messages: Vec<_> = diags.iter().map(|d| d.message.as_str()).collect();
    assert_eq!(
        messages,
        vec![
            "undefined schema 'Missing'",
            "undefined model 'nope'",
            "undefined tool 'ghost'",
            "undefined retry policy 'never'",
            "undefined timeout policy 'later'",
            "undefined flow 'other'",
            "undefined prompt 'nothing'",
        ]
    );
    assert!(diags.iter().all(|d| d.code == DiagnosticCode::E0001));
}

#[test]
fn test_errors_are_batched() {
    let source = "agent a:\n    description \"x\"\nagent a:\n    instruction missing\nflow main:\n    return $nope\n";
    assert_eq!(
        codes(source),
        vec![
            DiagnosticCode::E0010,
            DiagnosticCode::E0003,
            DiagnosticCode::E0001,
            DiagnosticCode::E0002
        ]
    );
}

#[test]
fn test_variable_scopes() {
    let source = format!(
        "{PRELUDE}on start do\n    $budget = 10\nend\nflow main:\n    for $item in $input do\n        log $item\n    end\n    log $item\n    return $budget\n"
    );
    let diags = validate(&source);
    assert_eq!(diags.len(), 1);
    assert_eq!(diags[0].code, DiagnosticCode::E0002);
    assert_eq!(diags[0].line, 10);
    assert_eq!(diags[0].message, "variable '$item' is used before it is defined");

    let one_branch = "flow main $flag:\n    if $flag do\n        $x = 1\n    end\n    return $x\n";
    let diags = validate(one_branch);
    assert_eq!(diags.len(), 1);
    assert_eq!(diags[0].code, DiagnosticCode::E0002);
    assert_eq!(diags[0].line, 5);

    let blocks = "flow main $flag:\n    if $flag do\n        $y = 1\n    else\n        $y = 2\n    end\n    loop max 2 do\n        $z = 1\n    end\n    match $flag do\n        when true -> $w = 1\n    end\n    return [$y, $z, $w]\n";
    let diags = validate(blocks);
    let found: Vec<_> = diags.iter().map(|d| (d.code, d.line, d.message.as_str())).collect();
    assert_eq!(
        found,
        vec![
            (DiagnosticCode::E0002, 13, "variable '$z' is used before it is defined"),
            (DiagnosticCode::E0002, 13, "variable '$w' is used before it is defined"),
        ]
    );
}

#[test]
fn test_flow_argument_count() {
    let source = "flow helper $a $b:\n    return $a\nflow main:\n    $r = run flow helper with $input\n    return $r\n";
    let diags = validate(source);
    assert_eq!(diags[0].code, DiagnosticCode::E0004);
    assert_eq!(diags[0].message, "flow 'helper' takes 2 argument(s) but 1 were given");
}

#[test]
fn test_model_property_types() {
    let source = "model main = \"x\":\n    temperature: \"hot\"\n    max_tokens: 1.5\n";
    let diags = validate(source);
    let messages: Vec<_> = diags.iter().map(|d| (d.code, d.message.as_str())).collect();
    assert_eq!(
        messages,
        vec![
            (DiagnosticCode::E0004, "model property 'temperature' expects a number"),
            (DiagnosticCode::E0004, "model property 'max_tokens' expects a positive integer"),
        ]
    );
}

#[test]
fn test_zero_attempt_retry_policy() {
    assert_eq!(codes("retry never = 0 times\n"), vec![DiagnosticCode::E0004]);
}

#[test]
fn test_schema_may_not_reference_schema() {
    let source = "schema A:\n    b: B\nschema B:\n    a: A\n";
    assert_eq!(codes(source), vec![DiagnosticCode::E0004, DiagnosticCode::E0004]);
}

#[test]
fn test_circular_delegation() {
    let source = format!(
        "{PRELUDE}agent a:\n    instruction p\n    delegate b\nagent b:\n    instruction p\n    use a\n"
    );
    let diags = validate(&source);
    assert_eq!(diags.len(), 1);
    assert_eq!(diags[0].code, DiagnosticCode::E0011);
    assert_eq!(diags[0].message, "circular agent reference: a -> b -> a");
    assert_eq!(diags[0].line, 3);
}

#[test]
fn test_forward_references_between_agents() {
    let source = format!(
        "{PRELUDE}agent lead:\n    instruction p\n    delegate writer\nagent writer:\n    instruction p\n"
    );
    assert!(codes(&source).is_empty());
}

#[test]
fn test_invalid_guardrail_action_context() {
    let source = "on tool-result do\n    retry with \"again\" if pii\nend\n";
    let diags = validate(source);
    assert_eq!(diags[0].code, DiagnosticCode::E0009);
    assert_eq!(
        diags[0].message,
        "'retry with' is only allowed in 'on output', not 'on tool-result'"
    );
}

#[test]
fn test_invalid_guardrail_pattern() {
    let diags = validate("guardrail card = regex \"[0-9{4}\"\n");
    assert_eq!(diags[0].code, DiagnosticCode::E0012);
    assert!(diags[0].message.starts_with("guardrail 'card' has an invalid pattern"));
}

#[test]
fn test_failure_block_must_be_top_level() {
    let source = "flow main:\n    loop max 2 do\n        on failure do\n            return 1\n        end\n    end\n";
    assert_eq!(codes(source), vec![DiagnosticCode::E0013]);
}

#[test]
fn test_mixed_composition_is_only_a_warning() {
    let source = format!(
        "{PRELUDE}agent a:\n    instruction p\n    delegate b\n    use c\nagent b:\n    instruction p\nagent c:\n    instruction p\n"
    );
    let diags = validate(&source);
    assert_eq!(diags.len(), 1);
    assert!(!diags[0].is_error());
    assert_eq!(diags[0].message, "agent 'a' defines both 'delegate' and 'use'");
    assert!(Compiler::default().compile(&source, "test.wv").is_ok());
}
