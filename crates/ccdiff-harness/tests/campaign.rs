//! End-to-end campaigns against shell-script stand-ins for the generator
//! and the compilers.

use std::fs;
use std::path::Path;
use std::sync::atomic::AtomicUsize;

use ccdiff_harness::config::{CommandTemplate, HarnessConfig};
use ccdiff_harness::persist::FailureRecord;
use ccdiff_harness::pool::{self, Campaign, CampaignSummary};
use ccdiff_harness::registry::{CompilerSpec, OptionSetSpec, TargetRegistry, ToolchainFamily};
use ccdiff_harness::seeds::{SeedQueue, load_seed_list};
use ccdiff_observability::{RunTag, Statistics};

const GENERATOR: &str = r#"printf 'Seed: %s\n' "$1"; printf 'int main() { return 0; }\n' > func.cpp"#;

/// Writes `<target>.out` holding the value the target "computes". Targets
/// starting with `bad` print 43, targets starting with `crash` fail to
/// build, and `clang*` targets emulate LLVM's opt-bisect output: with
/// fewer than four passes enabled they compute the right answer.
const BUILD: &str = r#"t="$1"; shift
limit=-1
for a in "$@"; do
  case "$a" in -opt-bisect-limit=*) limit="${a#-opt-bisect-limit=}";; esac
done
out=42
case "$t" in
  bad*) out=43;;
  crash*) echo "$t: LLVM ERROR: Cannot select: t5: i32 = urem t2, t3" >&2; exit 1;;
  clang*)
    n=7
    if [ "$limit" -ge 0 ] && [ "$limit" -lt 7 ]; then n=$limit; fi
    i=1
    while [ "$i" -le "$n" ]; do
      echo "BISECT: running pass ($i) Pass$i (function) on main" >&2
      i=$((i + 1))
    done
    if [ "$n" -ge 4 ]; then out=43; fi;;
esac
echo "$out" > "$t.out""#;

const RUN: &str = r#"cat "$1.out""#;

/// Like [`RUN`], but `*_rf` targets exit 1 when they compute the wrong value.
const CHECKED_RUN: &str = r#"out=$(cat "$1.out"); echo "$out"
case "$1" in *_rf) [ "$out" = 42 ] || exit 1;; esac"#;

struct Fixture {
    tmp: tempfile::TempDir,
    config: HarnessConfig,
    registry: TargetRegistry,
}

impl Fixture {
    fn new(targets: &[(&str, &str, ToolchainFamily)]) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = HarnessConfig::default();
        config.out_dir = tmp.path().join("out");
        config.jobs = 2;
        config.generator.command = CommandTemplate::new(["sh", "-c", GENERATOR, "gen"]);
        config.generator.seed_args = vec!["{seed}".to_owned()];
        config.commands.build =
            CommandTemplate::new(["sh", "-c", BUILD, "build", "{target}", "{blame}"]);
        config.commands.run = CommandTemplate::new(["sh", "-c", RUN, "run", "{target}"]);

        let mut compilers: Vec<CompilerSpec> = Vec::new();
        for (_, compiler, family) in targets {
            if !compilers.iter().any(|c| c.name == *compiler) {
                compilers.push(CompilerSpec {
                    name: (*compiler).to_owned(),
                    family: *family,
                    executable: None,
                    blame_profile: None,
                });
            }
        }
        let option_sets: Vec<OptionSetSpec> = targets
            .iter()
            .map(|(name, compiler, _)| OptionSetSpec {
                name: (*name).to_owned(),
                compiler: (*compiler).to_owned(),
                flags: "-O2".to_owned(),
                arch: None,
                sanitizer: None,
            })
            .collect();
        let registry = TargetRegistry::new(compilers, &option_sets).unwrap();
        Self {
            tmp,
            config,
            registry,
        }
    }

    fn out(&self) -> &Path {
        &self.config.out_dir
    }

    fn scratch(&self) -> &Path {
        self.tmp.path()
    }

    fn run(&self, seeds: &str) -> (CampaignSummary, Statistics) {
        self.config.validate().unwrap();
        let classifier = self.config.classifier().unwrap();
        let stats = Statistics::new(self.registry.option_sets().iter().map(|o| o.name.clone()));
        let active = AtomicUsize::new(0);
        let queue = SeedQueue::new(load_seed_list(seeds).unwrap());
        let campaign = Campaign {
            config: &self.config,
            registry: &self.registry,
            classifier: &classifier,
            stats: &stats,
            active: &active,
            seeds: Some(&queue),
            generator_version: "fake-gen 1.0",
        };
        let summary = pool::run_campaign(&campaign).unwrap();
        (summary, stats)
    }
}

fn read_record(dir: &Path) -> FailureRecord {
    serde_json::from_str(&fs::read_to_string(dir.join("record.json")).unwrap()).unwrap()
}

fn record_dirs(result: &Path) -> Vec<String> {
    fn walk(dir: &Path, root: &Path, out: &mut Vec<String>) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if path.join("record.json").is_file() {
                    out.push(path.strip_prefix(root).unwrap().to_string_lossy().into_owned());
                } else {
                    walk(&path, root, out);
                }
            }
        }
    }
    let mut out = Vec::new();
    walk(result, result, &mut out);
    out.sort();
    out
}

#[test]
fn agreeing_targets_write_no_records() {
    let fx = Fixture::new(&[
        ("gcc_o2", "gcc", ToolchainFamily::Gcc),
        ("gcc_o3", "gcc", ToolchainFamily::Gcc),
        ("other_o2", "other", ToolchainFamily::Other),
    ]);
    let (summary, stats) = fx.run("1 2 3");
    assert_eq!(summary.tests, 3);
    assert_eq!(summary.failed_tests, 0);
    assert_eq!(summary.records, 0);
    assert!(record_dirs(&fx.out().join("result")).is_empty());
    assert_eq!(stats.target_count("gcc_o2", RunTag::Total), 3);
    assert_eq!(stats.target_count("other_o2", RunTag::Ok), 3);
    assert_eq!(stats.generator_count(RunTag::Ok), 3);
    assert!(!fx.out().join("process_0").exists());
    assert!(!fx.out().join("process_1").exists());
}

#[test]
fn minority_output_is_saved_under_bad_compiler() {
    let fx = Fixture::new(&[
        ("gcc_o2", "gcc", ToolchainFamily::Gcc),
        ("gcc_o3", "gcc", ToolchainFamily::Gcc),
        ("bad_o2", "other", ToolchainFamily::Other),
    ]);
    let (summary, stats) = fx.run("S_5");
    assert_eq!(summary.tests, 1);
    assert_eq!(summary.failed_tests, 1);
    assert_eq!(
        record_dirs(&fx.out().join("result")),
        ["other/miscompare/S_5"]
    );
    let dir = fx.out().join("result/other/miscompare/S_5");
    assert!(dir.join("func.cpp").is_file());
    assert!(dir.join("bad_o2.out").is_file());
    let record = read_record(&dir);
    assert_eq!(record.seed, "5");
    assert_eq!(record.option_sets, ["bad_o2"]);
    assert_eq!(record.fingerprints.len(), 3);
    let log = fs::read_to_string(dir.join("log.txt")).unwrap();
    assert!(log.starts_with("Generator version: fake-gen 1.0\nSeed: 5\n"));
    assert!(log.contains("Optset: bad_o2\nOutput: 43"));
    assert_eq!(stats.target_count("bad_o2", RunTag::Miscompare), 1);
    assert_eq!(stats.target_count("gcc_o2", RunTag::Miscompare), 0);
    assert_eq!(summary.snapshot.target_total(RunTag::Miscompare), 1);
}

#[test]
fn identical_crashes_merge_into_one_record() {
    let fx = Fixture::new(&[
        ("gcc_o2", "gcc", ToolchainFamily::Gcc),
        ("crash_o2", "other", ToolchainFamily::Other),
        ("crash_o3", "other", ToolchainFamily::Other),
    ]);
    let (summary, stats) = fx.run("7");
    assert_eq!(summary.records, 1);
    let dir = fx.out().join("result/other/compfail/Cannot_select_urem/S_7");
    let record = read_record(&dir);
    assert_eq!(record.option_sets, ["crash_o2", "crash_o3"]);
    assert_eq!(record.classification.as_deref(), Some("Cannot_select_urem"));
    let log = fs::read_to_string(dir.join("log.txt")).unwrap();
    assert!(log.contains("Details for crash_o2 optset."));
    assert!(log.contains("Details for crash_o3 optset."));
    assert_eq!(stats.target_count("crash_o3", RunTag::Compfail), 1);
    assert_eq!(stats.target_count("gcc_o2", RunTag::Ok), 1);
}

#[test]
fn blame_names_the_first_bad_pass() {
    let mut fx = Fixture::new(&[
        ("gcc_o2", "gcc", ToolchainFamily::Gcc),
        ("gcc_o3", "gcc", ToolchainFamily::Gcc),
        ("clang_o3", "clang", ToolchainFamily::Clang),
    ]);
    fx.config.blame = true;
    let (summary, _) = fx.run("11");
    assert_eq!(summary.records, 1);
    let dir = fx.out().join("result/clang/miscompare/Pass4/S_11");
    let record = read_record(&dir);
    let blame = record.blame_result.unwrap();
    assert_eq!(blame.result, "was successful");
    assert_eq!(blame.phase.as_deref(), Some("Pass4"));
    let narrative = fs::read_to_string(dir.join("blame.log")).unwrap();
    assert!(narrative.contains("-mllvm -opt-bisect-limit=4"));
    let log = fs::read_to_string(dir.join("log.txt")).unwrap();
    assert!(log.contains("Blaming was successful\nOptimization to blame: Pass4\n"));
}

#[test]
fn build_description_reaches_blame_and_records() {
    let mut fx = Fixture::new(&[
        ("gcc_o2", "gcc", ToolchainFamily::Gcc),
        ("gcc_o3", "gcc", ToolchainFamily::Gcc),
        ("clang_o3", "clang", ToolchainFamily::Clang),
    ]);
    let desc = fx.scratch().join("desc");
    fs::create_dir_all(&desc).unwrap();
    fs::write(desc.join("build.sh"), BUILD).unwrap();
    fx.config.build_description = Some(desc.join("build.sh"));
    fx.config.commands.build =
        CommandTemplate::new(["sh", "{dir}/build.sh", "{target}", "{blame}"]);
    fx.config.blame = true;
    let (summary, _) = fx.run("11");
    assert_eq!(summary.records, 1);
    assert_eq!(
        record_dirs(&fx.out().join("result")),
        ["clang/miscompare/Pass4/S_11"]
    );
    let dir = fx.out().join("result/clang/miscompare/Pass4/S_11");
    assert!(dir.join("build.sh").is_file());
    assert!(dir.join("func.cpp").is_file());
    let blame = read_record(&dir).blame_result.unwrap();
    assert_eq!(blame.phase.as_deref(), Some("Pass4"));
}

#[test]
fn failing_run_is_classified_by_blamed_pass() {
    let mut fx = Fixture::new(&[
        ("gcc_o2", "gcc", ToolchainFamily::Gcc),
        ("clang_rf", "clang", ToolchainFamily::Clang),
    ]);
    fx.config.commands.run = CommandTemplate::new(["sh", "-c", CHECKED_RUN, "run", "{target}"]);
    fx.config.blame = true;
    let (summary, stats) = fx.run("13");
    assert_eq!(summary.failed_tests, 1);
    assert_eq!(
        record_dirs(&fx.out().join("result")),
        ["clang/runfail/Pass4/S_13"]
    );
    let dir = fx.out().join("result/clang/runfail/Pass4/S_13");
    let record = read_record(&dir);
    assert_eq!(record.option_sets, ["clang_rf"]);
    let blame = record.blame_result.unwrap();
    assert_eq!(blame.phase.as_deref(), Some("Pass4"));
    assert!(dir.join("blame.log").is_file());
    assert_eq!(stats.target_count("clang_rf", RunTag::Runfail), 1);
    assert_eq!(stats.target_count("gcc_o2", RunTag::Ok), 1);
}

#[test]
fn generator_failure_is_recorded() {
    let mut fx = Fixture::new(&[("gcc_o2", "gcc", ToolchainFamily::Gcc)]);
    fx.config.generator.command =
        CommandTemplate::new(["sh", "-c", "echo 'generator blew up' >&2; exit 3", "gen"]);
    let (summary, stats) = fx.run("9");
    assert_eq!(summary.records, 1);
    let dir = fx.out().join("result/gen_fail/gen_fail/S_9");
    let log = fs::read_to_string(dir.join("log.txt")).unwrap();
    assert!(log.contains("Generator exit code: 3"));
    assert!(log.contains("generator blew up"));
    assert_eq!(stats.generator_count(RunTag::Runfail), 1);
    assert_eq!(stats.target_count("gcc_o2", RunTag::Total), 0);
}

#[test]
fn spent_budget_starts_no_tests() {
    let mut fx = Fixture::new(&[("gcc_o2", "gcc", ToolchainFamily::Gcc)]);
    fx.config.time_budget_secs = Some(0);
    let (summary, _) = fx.run("1 2");
    assert_eq!(summary.tests, 0);
    assert_eq!(summary.records, 0);
}
