use anyhow::Result;
use console::style;

use super::CommandArgs;
use super::session::{Session, ctrl_c_token, open_database};
use crate::core::agent::{RunReport, RunResult};
use crate::core::schema::SchemaIntrospector;
use crate::core::terminal::{
    self, print_clarify, print_error, print_info, print_question, print_sql, print_status,
    print_step, print_success, print_warn,
};
use crate::core::trace::format_trace;

const DEMO_QUESTIONS: &[&str] = &[
    "Which teacher taught CS101 in Spring 2026 and what was the average grade?",
    "Who taught CS101 in Spring 2026?",
    "What was the average grade in CS101 Spring 2026?",
    "How many courses is Maya Patel enrolled in?",
    "Tell me about courses",
    "Which students passed CS201 in Fall 2025 with a grade above 90?",
];

pub(crate) async fn run_ask(args: &CommandArgs) -> Result<i32> {
    let Some(question) = args.question.as_deref().filter(|q| !q.trim().is_empty()) else {
        print_error("Error: --question is required for ask.");
        return Ok(2);
    };
    let session = Session::open(args)?;
    let cancel = ctrl_c_token();
    let report = session.agent.run_with_cancel(question, &cancel).await;
    print_report(&report, args.trace, &session);
    Ok(exit_code(&report.result))
}

pub(crate) async fn run_schema(args: &CommandArgs) -> Result<i32> {
    let db = open_database(args)?;
    let schema = SchemaIntrospector::describe(db.as_ref()).await?;
    print!("{}", schema.text());
    Ok(0)
}

pub(crate) async fn run_demo(args: &CommandArgs) -> Result<i32> {
    terminal::print_banner();
    let session = Session::open(args)?;
    let cancel = ctrl_c_token();
    print_status("Model", session.agent.llm().model());
    print_status(
        "Attempt budget",
        &session.agent.config().max_attempts.to_string(),
    );

    let mut failures = 0;
    for (i, question) in DEMO_QUESTIONS.iter().enumerate() {
        if cancel.is_cancelled() {
            print_warn("Demo cancelled.");
            break;
        }
        println!();
        print_step(&format!("Question {}/{}", i + 1, DEMO_QUESTIONS.len()));
        print_question(question);
        let report = session.agent.run_with_cancel(question, &cancel).await;
        print_report(&report, args.trace, &session);
        if report.result.is_failed() {
            failures += 1;
        }
    }

    println!();
    if failures == 0 {
        print_success("All demo questions finished.");
        Ok(0)
    } else {
        print_info(&format!("{} demo question(s) failed.", failures));
        Ok(1)
    }
}

fn print_report(report: &RunReport, show_trace: bool, session: &Session) {
    match &report.result {
        RunResult::Answered { text } => println!("{}", text),
        RunResult::Clarify { text } => print_clarify(text),
        RunResult::Failed { .. } => print_error(&report.result.message()),
    }

    if show_trace {
        if let Some(sql) = &report.final_sql {
            print_sql(sql);
        }
        println!(
            "\n{} run {} for \"{}\" ({} attempt(s))",
            style("Trace").bold().underlined(),
            report.run_id,
            report.question,
            report.attempts.len()
        );
        println!("{}", format_trace(&session.memory.events_for(&report.run_id)));
    }
}

fn exit_code(result: &RunResult) -> i32 {
    if result.is_failed() { 1 } else { 0 }
}
