//! Handlers of the pipeline jobs.

use chrono::{DateTime, Utc};
use shipyard_core::{Branch, Build, Error, ProcessSpec, Repository, Result};
use std::collections::HashSet;
use tracing::{debug, info};

use crate::Context;
use crate::checkout::{build_modules, checkout, dir_name, module_dirs};
use crate::command::{server_command, supports};
use crate::pipeline::{Job, JobOutcome};
use crate::result::evaluate;
use crate::status;
use crate::workspace::BuildDir;

/// Run `job` for `build`, saving whatever the job records on the build.
pub async fn run_job(ctx: &Context, build: &mut Build, job: Job) -> Result<JobOutcome> {
    debug!(build = %build.dest, job = %job, "Running job");
    let repo = ctx.store.get_repository(build.repo_id).await?;
    let branch = ctx.store.get_branch(build.branch_id).await?;
    match job {
        Job::Init => init(ctx, build).await,
        Job::TestBase => test_base(ctx, build).await,
        Job::TestAll => test_all(ctx, build, &branch).await,
        Job::Coverage => coverage(ctx, build, &branch).await,
        Job::Run => run(ctx, build, &repo).await,
    }
}

fn port(build: &Build) -> Result<u16> {
    build
        .port
        .ok_or_else(|| Error::Internal(format!("build {} has no port", build.dest)))
}

/// Process of `job`, locked and logged under the build's `logs/`.
fn job_process(dir: &BuildDir, job: Job, command: Vec<String>) -> ProcessSpec {
    let spec = ProcessSpec::new(command, dir.lock_path(job), dir.log_path(job)).cwd(dir.root());
    match job.cpu_limit() {
        Some(limit) => spec.cpu_limit(limit),
        None => spec,
    }
}

fn spawn(ctx: &Context, spec: &ProcessSpec) -> Result<JobOutcome> {
    let pid = ctx.supervisor.spawn(spec)?;
    info!(log = %spec.log_path.display(), pid, "Spawned job");
    Ok(JobOutcome::Spawned(pid))
}

/// Start from an empty database.
async fn fresh_database(ctx: &Context, name: &str) -> Result<()> {
    ctx.databases.drop_database(name).await?;
    ctx.databases.create_database(name).await
}

fn coverage_file(dir: &BuildDir) -> String {
    dir.path(".coverage").display().to_string()
}

async fn init(ctx: &Context, build: &mut Build) -> Result<JobOutcome> {
    ctx.log_build(build.id, "init", "Init build environment").await;
    status::report(ctx, build).await;
    checkout(ctx, build).await?;
    Ok(JobOutcome::NoProcess)
}

async fn test_base(ctx: &Context, build: &mut Build) -> Result<JobOutcome> {
    ctx.log_build(build.id, "test_base", "Start test base module").await;
    let dir = ctx.build_dir(build);
    let database = format!("{}-base", build.dest);
    fresh_database(ctx, &database).await?;

    let mut cmd = server_command(&ctx.settings, &dir, port(build)?)?;
    if supports(&dir, "test-enable") {
        cmd.push("--test-enable".to_string());
    }
    cmd.extend(
        [
            "-d",
            &database,
            "-i",
            "base",
            "--stop-after-init",
            "--log-level=test",
            "--max-cron-threads=0",
        ]
        .map(String::from),
    );
    spawn(ctx, &job_process(&dir, Job::TestBase, cmd))
}

async fn test_all(ctx: &Context, build: &mut Build, branch: &Branch) -> Result<JobOutcome> {
    ctx.log_build(build.id, "test_all", "Start test all modules").await;
    let dir = ctx.build_dir(build);
    let database = format!("{}-all", build.dest);
    fresh_database(ctx, &database).await?;

    let mut cmd = server_command(&ctx.settings, &dir, port(build)?)?;
    if supports(&dir, "test-enable") {
        cmd.push("--test-enable".to_string());
    }
    cmd.push("-d".to_string());
    cmd.push(database);
    let modules = build_modules(build);
    if !modules.is_empty() {
        cmd.push("-i".to_string());
        cmd.push(modules.join(","));
    }
    cmd.extend(["--stop-after-init", "--log-level=test", "--max-cron-threads=0"].map(String::from));

    if branch.coverage {
        let tested: HashSet<&str> = modules.iter().map(String::as_str).collect();
        let untested: Vec<String> = module_dirs(&dir.server_path("addons"))
            .await?
            .into_iter()
            .filter(|path| !tested.contains(dir_name(path).as_str()))
            .map(|path| path.display().to_string())
            .collect();
        let mut wrapped = vec![
            "coverage".to_string(),
            "run".to_string(),
            "--branch".to_string(),
            "--source".to_string(),
            dir.server().display().to_string(),
        ];
        if !untested.is_empty() {
            wrapped.push("--omit".to_string());
            wrapped.push(untested.join(","));
        }
        wrapped.extend(cmd);
        cmd = wrapped;
    }
    let mut spec = job_process(&dir, Job::TestAll, cmd);
    if branch.coverage {
        spec = spec.env("COVERAGE_FILE", coverage_file(&dir));
    }

    // The job time of the full test run excludes checkout and base tests.
    build.job_start = Some(Utc::now());
    ctx.save_from(build, build.state).await?;
    spawn(ctx, &spec)
}

async fn coverage(ctx: &Context, build: &Build, branch: &Branch) -> Result<JobOutcome> {
    if !branch.coverage {
        return Ok(JobOutcome::NoProcess);
    }
    let dir = ctx.build_dir(build);
    let report = dir.path("coverage");
    tokio::fs::create_dir_all(&report).await?;
    let cmd = vec![
        "coverage".to_string(),
        "html".to_string(),
        "-d".to_string(),
        report.display().to_string(),
        "--ignore-errors".to_string(),
    ];
    let spec = job_process(&dir, Job::Coverage, cmd).env("COVERAGE_FILE", coverage_file(&dir));
    spawn(ctx, &spec)
}

/// Judge the full test run, then start the server for manual testing.
async fn run(ctx: &Context, build: &mut Build, repo: &Repository) -> Result<JobOutcome> {
    ctx.log_build(build.id, "run", &format!("Start running build {}", build.dest))
        .await;
    let dir = ctx.build_dir(build);

    let test_log = dir.log_path(Job::TestAll);
    let (log, finished) = match tokio::fs::read(&test_log).await {
        Ok(bytes) => {
            let finished = tokio::fs::metadata(&test_log)
                .await
                .and_then(|m| m.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            (String::from_utf8_lossy(&bytes).into_owned(), finished)
        }
        Err(_) => (String::new(), Utc::now()),
    };
    let post_install_tests = tokio::fs::read(dir.server_path("test/common.py"))
        .await
        .is_ok_and(|bytes| String::from_utf8_lossy(&bytes).contains("post_install"));
    build.job_end = Some(finished);
    if let Some(result) = evaluate(&log, post_install_tests) {
        build.result = Some(result);
    }
    ctx.save_from(build, build.state).await?;
    status::report(ctx, build).await;

    let port = port(build)?;
    let mut cmd = server_command(&ctx.settings, &dir, port)?;
    if tokio::fs::try_exists(dir.server_path("addons/im_livechat")).await? {
        cmd.extend(["--workers".to_string(), "2".to_string()]);
        cmd.extend(["--longpolling-port".to_string(), (u32::from(port) + 1).to_string()]);
        cmd.extend(["--max-cron-threads".to_string(), "1".to_string()]);
    } else {
        cmd.extend(["--max-cron-threads".to_string(), "0".to_string()]);
    }
    cmd.extend(["-d".to_string(), format!("{}-all", build.dest)]);
    if supports(&dir, "db-filter") {
        let filter = if repo.nginx {
            "%d.*$".to_string()
        } else {
            format!("{}.*$", build.dest)
        };
        cmd.extend(["--db-filter".to_string(), filter]);
    }
    spawn(ctx, &job_process(&dir, Job::Run, cmd))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestEnv;
    use shipyard_core::{BuildResult, BuildState, Store};

    const SERVER: &str = "git@example.com:acme/server.git";

    fn server_tree() -> Vec<(&'static str, &'static str)> {
        vec![
            ("odoo-bin", ""),
            ("odoo/__init__.py", ""),
            ("odoo/tools/config.py", "--test-enable --db-filter"),
            ("odoo/addons/base/__manifest__.py", "{}"),
            ("addons/sale/__manifest__.py", "{}"),
            ("addons/crm/__manifest__.py", "{}"),
        ]
    }

    async fn testing_build(env: &TestEnv, ref_name: &str) -> (Repository, Build) {
        let (repo, branch) = env.repo_with_branch(SERVER, ref_name).await;
        env.vcs.set_tree(&repo, "abcdef1", &server_tree());
        let mut build = env.build(&repo, &branch, "abcdef1").await;
        build.state = BuildState::Testing;
        build.port = Some(2010);
        build.host = Some("worker-1".to_string());
        env.store.update_build(&build).await.unwrap();
        (repo, build)
    }

    #[tokio::test]
    async fn test_init_checks_out_without_process() {
        let env = TestEnv::new().await;
        let (_, mut build) = testing_build(&env, "refs/heads/master").await;

        let outcome = run_job(&env.ctx, &mut build, Job::Init).await.unwrap();

        assert_eq!(outcome, JobOutcome::NoProcess);
        assert_eq!(env.reload(&build).await.modules.as_deref(), Some("base,crm,sale"));
        assert_eq!(env.hosting.statuses().len(), 1);
        assert!(env.supervisor.spawned().is_empty());
    }

    #[tokio::test]
    async fn test_test_jobs_spawn_server_commands() {
        let env = TestEnv::new().await;
        let (_, mut build) = testing_build(&env, "refs/heads/master").await;
        run_job(&env.ctx, &mut build, Job::Init).await.unwrap();
        let dir = env.ctx.build_dir(&build);

        run_job(&env.ctx, &mut build, Job::TestBase).await.unwrap();
        let spec = env.supervisor.last_spawned();
        assert_eq!(spec.cpu_limit, Some(300));
        assert_eq!(spec.lock_path, dir.lock_path(Job::TestBase));
        assert_eq!(spec.cwd.as_deref(), Some(dir.root()));
        assert!(spec.command.contains(&"--xmlrpc-port=2010".to_string()));
        assert!(spec.command.contains(&"--test-enable".to_string()));
        assert!(spec.command.windows(2).any(|w| w == ["-i", "base"]));
        assert!(env.databases.names().contains(&format!("{}-base", build.dest)));

        run_job(&env.ctx, &mut build, Job::TestAll).await.unwrap();
        let spec = env.supervisor.last_spawned();
        assert_eq!(spec.cpu_limit, Some(2100));
        assert!(spec.command.windows(2).any(|w| w == ["-i", "base,crm,sale"]));
        assert!(spec.env.is_empty());
        assert!(env.reload(&build).await.job_start.is_some());

        let outcome = run_job(&env.ctx, &mut build, Job::Coverage).await.unwrap();
        assert_eq!(outcome, JobOutcome::NoProcess);
    }

    #[tokio::test]
    async fn test_coverage_wraps_the_full_test_run() {
        let env = TestEnv::new().await;
        let (repo, mut build) = testing_build(&env, "refs/heads/master").await;
        let mut branch = env.store.get_branch(build.branch_id).await.unwrap();
        branch.coverage = true;
        branch.modules = Some("sale".to_string());
        env.store.update_branch(&branch).await.unwrap();
        let mut repo = repo;
        repo.modules_auto = shipyard_core::ModulesAuto::ExplicitOnly;
        env.store.update_repository(&repo).await.unwrap();
        run_job(&env.ctx, &mut build, Job::Init).await.unwrap();
        let dir = env.ctx.build_dir(&build);

        run_job(&env.ctx, &mut build, Job::TestAll).await.unwrap();
        let spec = env.supervisor.last_spawned();
        assert_eq!(&spec.command[..3], ["coverage", "run", "--branch"]);
        let omit = spec.command.iter().position(|a| a == "--omit").unwrap();
        assert!(spec.command[omit + 1].contains("crm"));
        assert!(!spec.command[omit + 1].contains("sale"));
        assert_eq!(
            spec.env,
            vec![("COVERAGE_FILE".to_string(), coverage_file(&dir))]
        );

        let outcome = run_job(&env.ctx, &mut build, Job::Coverage).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Spawned(_)));
        assert!(dir.path("coverage").is_dir());
    }

    #[tokio::test]
    async fn test_run_judges_the_test_log() {
        let env = TestEnv::new().await;
        let (_, mut build) = testing_build(&env, "refs/heads/master").await;
        run_job(&env.ctx, &mut build, Job::Init).await.unwrap();
        let dir = env.ctx.build_dir(&build);
        std::fs::write(
            dir.log_path(Job::TestAll),
            "2024-01-01 10:00:00,123 42 INFO db odoo.modules.loading: Modules loaded.\n",
        )
        .unwrap();
        build.state = BuildState::Running;
        env.store.update_build(&build).await.unwrap();

        run_job(&env.ctx, &mut build, Job::Run).await.unwrap();

        let saved = env.reload(&build).await;
        assert_eq!(saved.result, Some(BuildResult::Ok));
        assert!(saved.job_end.is_some());
        let spec = env.supervisor.last_spawned();
        assert_eq!(spec.cpu_limit, None);
        assert!(spec.command.windows(2).any(|w| w == ["--max-cron-threads", "0"]));
        assert!(
            spec.command
                .windows(2)
                .any(|w| w[0] == "--db-filter" && w[1] == format!("{}.*$", build.dest))
        );
        let status = env.hosting.statuses().pop().unwrap().1;
        assert_eq!(status.state, shipyard_core::StatusState::Success);
    }

    #[tokio::test]
    async fn test_run_without_log_is_ko() {
        let env = TestEnv::new().await;
        let (_, mut build) = testing_build(&env, "refs/heads/master").await;
        run_job(&env.ctx, &mut build, Job::Init).await.unwrap();

        run_job(&env.ctx, &mut build, Job::Run).await.unwrap();
        assert_eq!(env.reload(&build).await.result, Some(BuildResult::Ko));
    }
}
