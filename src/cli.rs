use std::io::{self, Write};

use recall::lifecycle::{CollectionStats, PurgeReport};
use recall::collection::CompactionReport;
use recall::model::{Metadata, Scope, StoredDocument};
use recall::parser::{self, Command};
use recall::protocol::{
    ClearReply, ClearRequest, Client, ContextRequest, ErrorReply, GetRequest, PurgeRequest,
    QueryRequest, StatsRequest, StoreReply, StoreRequest, OP_CLEAR, OP_COMPACT, OP_CONTEXT,
    OP_GET, OP_PURGE, OP_QUERY, OP_STATS, OP_STORE,
};
use recall::{ContextBundle, SimilarRecord};

const DEFAULT_HOST: &str = "127.0.0.1:9000";

fn main() {
    print_banner();
    let host = std::env::var("RECALL_ADDR").unwrap_or_else(|_| DEFAULT_HOST.to_string());

    let mut client = match Client::connect(&host) {
        Ok(client) => {
            println!("[\u{2713}] Connected to recall at {}!", host);
            client
        }
        Err(_) => {
            println!("[\u{2717}] Could not connect to server at {}.", host);
            println!("    Start it with 'cargo run --release --bin recall' in another terminal.");
            return;
        }
    };
    println!("Type 'HELP' for supported commands or 'EXIT' to quit.\n");

    let stdin = io::stdin();
    let mut buffer = String::new();

    loop {
        print!("recall> ");
        let _ = io::stdout().flush();
        buffer.clear();

        match stdin.read_line(&mut buffer) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        if buffer.trim().is_empty() { continue; }

        match parser::parse_command(&buffer) {
            Ok(Command::Exit) => break,
            Ok(cmd) => {
                if let Err(e) = execute_command(&mut client, cmd) {
                    println!("[\u{26a0}\u{fe0f} Error] {}", e);
                    if e.kind == "io" {
                        match Client::connect(&host) {
                            Ok(fresh) => client = fresh,
                            Err(_) => println!("    Server unreachable; retry once it is back."),
                        }
                    }
                }
            }
            Err(e) => {
                println!("[\u{2717} Syntax Error] {}", e);
                if buffer.to_uppercase().starts_with("FIND") {
                    println!("    \u{2139}\u{fe0f}  Hint: FIND IN code_submissions \"text\" USER 'u1' PROJECT 'p1' LIMIT 5");
                }
            }
        }
    }
}

fn print_banner() {
    println!("\n==================================================");
    println!("   recall CLI - context memory for code review");
    println!("==================================================\n");
}

fn print_help() {
    println!("\n--- Available Commands ---");
    println!("1. FIND:    FIND IN <collection> \"text\" USER 'u' [PROJECT 'p'] [LIMIT n]");
    println!("2. CONTEXT: CONTEXT USER 'u' PROJECT 'p' FOR security|logic|testing \"code\"");
    println!("3. STORE:   STORE INTO <collection> \"document\" USER 'u' [PROJECT 'p'] [ID 'id']");
    println!("4. GET:     GET <collection> 'id'");
    println!("5. STATS:   STATS [USER 'u']");
    println!("6. PURGE:   PURGE 'u'");
    println!("7. COMPACT: COMPACT");
    println!("8. CLEAR:   CLEAR <collection>   (every user's records)");
    println!("9. EXIT:    Quit");
    println!("Collections: code_submissions, security_reviews, logic_reviews, user_context, project_context\n");
}

fn execute_command(client: &mut Client, cmd: Command) -> Result<(), ErrorReply> {
    match cmd {
        Command::Help => { print_help(); Ok(()) },
        Command::Find { collection, text, user_id, project_id, limit } => {
            let scope = Scope { user_id, project_id };
            let hits: Vec<SimilarRecord> = client.call(
                OP_QUERY,
                &QueryRequest { collection, text, scope, n_results: limit },
            )?;
            print_hits(&hits);
            Ok(())
        }
        Command::Context { user_id, project_id, review_type, code } => {
            let bundle: ContextBundle = client.call(
                OP_CONTEXT,
                &ContextRequest { user_id, project_id, code, review_type },
            )?;
            println!("\n== similar code ==");
            print_hits(&bundle.similar_code);
            println!("== past issues ==");
            print_hits(&bundle.past_issues);
            println!("== project ==");
            match &bundle.project_context {
                Some(doc) => println!("{}\n", doc.document),
                None => println!("(none)\n"),
            }
            println!("== preferences ==");
            print_hits(&bundle.user_preferences);
            if !bundle.degraded.is_empty() {
                println!("[\u{26a0}\u{fe0f}] Unavailable sources: {}", bundle.degraded.join(", "));
            }
            Ok(())
        }
        Command::Store { collection, document, user_id, project_id, id } => {
            let mut metadata = Metadata::new().with("user_id", user_id);
            if let Some(project_id) = project_id {
                metadata.insert("project_id", project_id);
            }
            let reply: StoreReply = client.call(
                OP_STORE,
                &StoreRequest { collection, id, document, metadata },
            )?;
            println!("[\u{2713} OK] Stored ID: {}", reply.id);
            Ok(())
        }
        Command::Get { collection, id } => {
            let doc: StoredDocument = client.call(OP_GET, &GetRequest { collection, id })?;
            println!("ID: {}", doc.id);
            println!("Metadata: {}", serde_json::to_string(&doc.metadata).unwrap_or_default());
            println!("{}\n", doc.document);
            Ok(())
        }
        Command::Stats { user_id } => {
            let scope = user_id.map(Scope::user);
            let stats: CollectionStats = client.call(OP_STATS, &StatsRequest { scope })?;
            for (kind, count) in stats.iter() {
                println!("  {:<18} {}", kind, count);
            }
            println!("  {:<18} {}\n", "total", stats.total());
            Ok(())
        }
        Command::Purge { user_id } => {
            let report: PurgeReport = client.call(OP_PURGE, &PurgeRequest { user_id })?;
            println!("[\u{2713} OK] Deleted {} records for {}", report.deleted_count, report.user_id);
            for (kind, count) in report.per_collection.iter() {
                println!("  {:<18} {}", kind, count);
            }
            Ok(())
        }
        Command::Compact => {
            let reports: Vec<CompactionReport> = client.call(OP_COMPACT, &serde_json::json!({}))?;
            for r in reports {
                println!("  {:<18} {} live, {} -> {} bytes", r.collection, r.live_records, r.bytes_before, r.bytes_after);
            }
            Ok(())
        }
        Command::Clear { collection } => {
            let reply: ClearReply = client.call(OP_CLEAR, &ClearRequest { collection })?;
            println!("[\u{2713} OK] Cleared {} records from {}", reply.removed, collection);
            Ok(())
        }
        Command::Exit => Ok(()),
    }
}

fn print_hits(hits: &[SimilarRecord]) {
    if hits.is_empty() {
        println!("(no matches)\n");
        return;
    }
    println!("Found {} matches:", hits.len());
    for hit in hits {
        let first_line = hit.document.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
        println!("  \u{2022} {} ({:.1}% | dist {:.4}) {}", hit.id, hit.similarity, hit.distance, first_line.trim());
    }
    println!();
}
