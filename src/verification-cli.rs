//! A simple CLI tool for verifying tallied elections offline.
//! This uses the server's own verification code, and so reads the output of
//! `GET /elections/<election_id>/dump` directly.

use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io::BufReader;

use clap::{Arg, ArgAction, ArgMatches, Command};
use rocket::serde::json::serde_json;

use evote_backend::model::dump::{DumpFault, ElectionDump};

const PROGRAM_NAME: &str = "verify-evote";

const ABOUT_TEXT: &str = "Verify the ledger and tally of an election.

EXIT CODES:
     0: Verification succeeded.
   255: Ran successfully, but verification failed.
 Other: Error.";

const DUMP_PATH: &str = "DUMP_PATH";

const DUMP_PATH_HELP: &str = "The path to a JSON dump of a tallied election,\n\
as returned by `GET /elections/<election_id>/dump`";

/// Construct the CLI configuration.
fn cli() -> Command {
    // Make the build dirty when the toml changes.
    include_str!("../Cargo.toml");

    clap::command!(PROGRAM_NAME).about(ABOUT_TEXT).arg(
        Arg::new(DUMP_PATH)
            .help(DUMP_PATH_HELP)
            .action(ArgAction::Set)
            .required(true),
    )
}

/// Errors that this program may produce.
#[derive(Debug, Eq, PartialEq)]
enum Error {
    /// IO error described by the inner message.
    IO(String),
    /// Failed to decode the JSON dump.
    Format(String),
    /// Verification failed due to the contained reason.
    Verification(DumpFault),
}

/// The verified count for one candidate.
#[derive(Debug, Eq, PartialEq)]
struct FriendlyResults {
    pub candidate_name: String,
    pub party: String,
    pub count: u64,
}

impl Display for FriendlyResults {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}): {} vote{}",
            self.candidate_name,
            self.party,
            self.count,
            if self.count != 1 { "s" } else { "" }
        )
    }
}

/// What a successful run reports.
#[derive(Debug, Eq, PartialEq)]
struct Verified {
    pub blocks: u64,
    pub total: u64,
    pub results: Vec<FriendlyResults>,
}

/// Run verification.
fn verify(path: &str) -> Result<Verified, Error> {
    // Load the file.
    let file = BufReader::new(File::open(path).map_err(|e| Error::IO(e.to_string()))?);
    let dump: ElectionDump = serde_json::from_reader(file).map_err(|e| Error::Format(e.to_string()))?;

    // Run verification.
    let summary = dump.verify().map_err(Error::Verification)?;

    // Pair each count with its candidate, most votes first.
    let bundle = &dump.tally.bundle;
    let mut results = bundle
        .slate
        .iter()
        .map(|candidate| FriendlyResults {
            candidate_name: candidate.name.clone(),
            party: candidate.party.clone(),
            count: bundle
                .counts
                .iter()
                .find(|count| count.candidate_id == candidate.candidate_id)
                .map_or(0, |count| count.count),
        })
        .collect::<Vec<_>>();
    results.sort_unstable_by(|a, b| a.candidate_name.cmp(&b.candidate_name));
    results.sort_by(|a, b| b.count.cmp(&a.count));

    Ok(Verified {
        blocks: summary.blocks,
        total: summary.total,
        results,
    })
}

/// Run verification, report the result, and return the exit code.
fn run(args: &ArgMatches) -> u8 {
    let Some(path) = args.get_one::<String>(DUMP_PATH) else {
        println!("No dump path given");
        return 1;
    };
    match verify(path) {
        Ok(verified) => {
            println!(
                "Verification succeeded: {} ballot{} in a ledger of {} block{}.",
                verified.total,
                if verified.total != 1 { "s" } else { "" },
                verified.blocks,
                if verified.blocks != 1 { "s" } else { "" }
            );
            for result in verified.results {
                println!("{}", result);
            }
            0
        }
        Err(Error::IO(msg)) => {
            println!("IO error: {}", msg);
            1
        }
        Err(Error::Format(msg)) => {
            println!("Invalid JSON: {}", msg);
            1
        }
        Err(Error::Verification(fault)) => {
            println!("Verification failed: {}", fault);
            255
        }
    }
}

fn main() {
    let args = cli().get_matches();
    let exit_code = run(&args);
    std::process::exit(exit_code.into())
}
