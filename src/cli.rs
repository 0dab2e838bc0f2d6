use std::io::{self, Write};

use clap::Parser;
use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use testledger::actions::{Action, ActionOutcome, ActionRequest, AddTestArgs, Authorization, ClearArgs};
use testledger::model::{Table, TestRecord};
use testledger::name::Name;
use testledger::parser::{self, Command, Filter};
use testledger::query::{TableQuery, TableRows};

#[derive(Parser, Clone, Debug)]
#[clap(author, version, about = "Interactive shell for a testledger node", long_about = None)]
struct Args {
    /// Base URL of the node's HTTP API
    #[clap(long, default_value = "http://127.0.0.1:8888")]
    host: String,

    /// Namespace the tables live under
    #[clap(long, default_value = "llmtest")]
    account: Name,
}

struct Session {
    client: Client,
    host: String,
    account: Name,
}

fn main() {
    let args = Args::parse();
    print_banner();

    let session = Session {
        client: Client::new(),
        host: args.host.trim_end_matches('/').to_string(),
        account: args.account,
    };

    match session.health() {
        Ok(()) => println!("[\u{2713}] Connected to testledger at {} (account {})", session.host, session.account),
        Err(e) => {
            println!("[\u{2717}] Could not reach {}: {}", session.host, e);
            println!("    Make sure the node is running: 'cargo run --release --bin testledger'.");
            return;
        }
    }
    println!("Type 'HELP' for supported commands or 'EXIT' to quit.\n");

    let stdin = io::stdin();
    let mut buffer = String::new();

    loop {
        print!("testledger> ");
        io::stdout().flush().ok();
        buffer.clear();

        match stdin.read_line(&mut buffer) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        if buffer.trim().is_empty() {
            continue;
        }

        match parser::parse_command(&buffer) {
            Ok(Command::Exit) => break,
            Ok(cmd) => {
                if let Err(e) = session.execute(cmd) {
                    println!("[\u{26a0}\u{fe0f} Error] {}", e);
                }
            }
            Err(e) => {
                println!("[\u{2717} Syntax Error] {}", e);
                if buffer.to_uppercase().starts_with("SELECT") {
                    println!("    \u{2139}\u{fe0f}  Hint: Try 'SELECT FROM TESTS WHERE users = alice LIMIT 5'");
                } else if buffer.to_uppercase().starts_with("ADD") {
                    println!("    \u{2139}\u{fe0f}  Hint: Try 'ADD TEST alice t1 \"description\" [0.5, 1.0]'");
                }
            }
        }
    }
    println!("Bye.");
}

fn print_banner() {
    println!("\n==================================================");
    println!("   testledger CLI - test execution records");
    println!("==================================================\n");
}

fn print_help() {
    println!("\n--- Available Commands ---");
    println!("1. ADD:    ADD [TIMED] TEST <creator> <testid> \"description\" [0.5, 1.0]");
    println!("2. CLEAR:  CLEAR [TIMED] TESTS [<user>]");
    println!("3. SELECT: SELECT FROM [TIMED] TESTS [WHERE <index> = v] [LIMIT n]");
    println!("           SELECT FROM [TIMED] TESTS WHERE <index> BETWEEN a AND b");
    println!("           indexes: id, timestamp, users, testid");
    println!("4. GET:    GET [TIMED] TEST <id>");
    println!("5. EXIT:   Quit\n");
}

fn table(timed: bool) -> Table {
    if timed {
        Table::TimedTests
    } else {
        Table::Tests
    }
}

impl Session {
    fn execute(&self, cmd: Command) -> Result<(), String> {
        match cmd {
            Command::Help => {
                print_help();
                Ok(())
            }
            Command::Add { timed, creator, testid, description, results } => {
                let args = AddTestArgs { creator, testid, description, results };
                let action = if timed { Action::AddTimeTest(args) } else { Action::AddTest(args) };
                match self.push(&action, creator)? {
                    ActionOutcome::Added(r) => {
                        println!("[\u{2713} OK] Stored id {} ({} results) at {}", r.id, r.size, r.timestamp);
                    }
                    other => println!("[\u{2713} OK] {:?}", other),
                }
                Ok(())
            }
            Command::Clear { timed, user } => {
                let args = ClearArgs { user: user.unwrap_or(self.account) };
                let action = if timed { Action::ClearAllTimed(args) } else { Action::ClearAll(args) };
                match self.push(&action, self.account)? {
                    ActionOutcome::Cleared { removed } => println!("[\u{2713} OK] Removed {} records", removed),
                    other => println!("[\u{2713} OK] {:?}", other),
                }
                Ok(())
            }
            Command::Select { timed, filter, limit } => {
                let mut query = TableQuery::new(self.account, table(timed));
                query.limit = limit;
                match filter {
                    Some(Filter::Equals { index, value }) => {
                        query.index = Some(index);
                        query.lower_bound = Some(value.clone());
                        query.upper_bound = Some(value);
                    }
                    Some(Filter::Between { index, lower, upper }) => {
                        query.index = Some(index);
                        query.lower_bound = Some(lower);
                        query.upper_bound = Some(upper);
                    }
                    None => {}
                }
                let page = self.rows(&query)?;
                println!("\nFound {} records:", page.rows.len());
                for record in &page.rows {
                    print_record(record);
                }
                if let Some(next) = page.next_key {
                    println!("  ... more from {}", next);
                }
                println!();
                Ok(())
            }
            Command::Get { timed, id } => {
                let mut query = TableQuery::new(self.account, table(timed));
                query.lower_bound = Some(id.to_string());
                query.upper_bound = Some(id.to_string());
                query.limit = Some(1);
                match self.rows(&query)?.rows.first() {
                    Some(record) => print_record(record),
                    None => println!("[\u{2717}] No record with id {}.", id),
                }
                Ok(())
            }
            Command::Exit => Ok(()),
        }
    }

    fn health(&self) -> Result<(), String> {
        let res = self
            .client
            .get(format!("{}/v1/health", self.host))
            .send()
            .map_err(|e| e.to_string())?;
        if res.status().is_success() {
            Ok(())
        } else {
            Err(format!("health check returned {}", res.status()))
        }
    }

    fn push(&self, action: &Action, actor: Name) -> Result<ActionOutcome, String> {
        let request = ActionRequest::new(self.account, action, vec![Authorization::active(actor)])
            .map_err(|e| e.to_string())?;
        self.post("/v1/chain/push_action", &request)
    }

    fn rows(&self, query: &TableQuery) -> Result<TableRows, String> {
        self.post("/v1/chain/get_table_rows", query)
    }

    fn post<T: Serialize, R: DeserializeOwned>(&self, path: &str, body: &T) -> Result<R, String> {
        let res = self
            .client
            .post(format!("{}{}", self.host, path))
            .json(body)
            .send()
            .map_err(|e| e.to_string())?;

        let status = res.status();
        if status.is_success() {
            return res.json::<R>().map_err(|e| e.to_string());
        }
        let body: Value = res.json().unwrap_or(Value::Null);
        let message = body["message"].as_str().unwrap_or("request failed");
        Err(format!("{} ({})", message, status))
    }
}

fn print_record(record: &TestRecord) {
    println!(
        "  #{:<4} {:<12} {:<12} @{} {:?} \"{}\"",
        record.id,
        record.owner.to_string(),
        record.test_id.to_string(),
        record.created_at,
        record.results,
        record.description
    );
}
