//! Manual-control REPL for `carlink server --manual`.
//!
//! Every drive command goes through [`Server::send_manual`], the same path
//! the decision loop uses; leaving the REPL sends a final stop.

use carlink_runtime::{Server, parse_manual};
use carlink_types::ActuatorCommand;
use colored::Colorize;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Drive(ActuatorCommand),
    Status,
    Help,
    Quit,
    Empty,
    Unknown(String),
}

pub fn parse_line(line: &str) -> ReplCommand {
    let line = line.trim();
    match line.to_ascii_lowercase().as_str() {
        "" => ReplCommand::Empty,
        "help" | "?" => ReplCommand::Help,
        "status" => ReplCommand::Status,
        "quit" | "exit" | "q" => ReplCommand::Quit,
        _ => match parse_manual(line) {
            Some(command) => ReplCommand::Drive(command),
            None => ReplCommand::Unknown(line.to_string()),
        },
    }
}

/// Read commands until `quit`, end of input, Ctrl-C or `shutdown`.
pub fn run(server: &Server, shutdown: &watch::Receiver<bool>) {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("{}: {}", "Cannot open terminal".red(), e);
            return;
        }
    };
    print_help();

    loop {
        if *shutdown.borrow() {
            break;
        }
        let line = match editor.readline(&format!("{} ", "carlink>".bold().cyan())) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        };
        let _ = editor.add_history_entry(line.as_str());

        match parse_line(&line) {
            ReplCommand::Empty => {}
            ReplCommand::Help => print_help(),
            ReplCommand::Status => print_status(server),
            ReplCommand::Quit => break,
            ReplCommand::Drive(command) => match server.send_manual(command) {
                Ok(()) => println!("  {} {}", "sent".green(), command.to_string().bold()),
                Err(e) => println!("  {} {}", "not sent:".yellow(), e),
            },
            ReplCommand::Unknown(text) => println!(
                "{} '{}'. Type {} for available commands.",
                "Unknown command:".red(),
                text.yellow(),
                "help".bold()
            ),
        }
    }

    if server.send_manual(ActuatorCommand::NEUTRAL).is_ok() {
        println!("  {}", "final stop sent".green());
    }
}

fn print_help() {
    println!();
    println!("{}", "Manual control".bold().underline());
    println!("  {}      forward [speed]", "f | forward".bold().cyan());
    println!("  {}     backward [speed]", "b | backward".bold().cyan());
    println!("  {}         rotate left [speed]", "l | left".bold().cyan());
    println!("  {}        rotate right [speed]", "r | right".bold().cyan());
    println!("  {}         neutral", "s | stop".bold().cyan());
    println!("  {}    raw command, e.g. 200,200,1,1", "l,r,ld,rd".bold().cyan());
    println!("  {}           link state and counters", "status".bold().cyan());
    println!("  {}   leave (sends a final stop)", "quit | exit".bold().cyan());
    println!();
}

fn print_status(server: &Server) {
    let stats = server.stats();
    println!("  link     : {}", server.state().to_string().bold());
    println!(
        "  frames   : {} received, {} malformed, {} queued",
        stats.link.received, stats.link.malformed, stats.queued_frames
    );
    println!(
        "  commands : {} sent, {} dropped",
        stats.link.sent, stats.link.dropped
    );
}
