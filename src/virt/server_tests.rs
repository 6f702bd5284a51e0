use super::null::NullBackend;
use super::*;
use crate::protocol::{encode_request, parse_reply, ReplyStatus};
use std::io::Cursor;
use std::path::PathBuf;
use tempfile::TempDir;

/// Backend whose scratch directory is a fixed host directory.
struct FixedDir {
    dir: PathBuf,
    opened: bool,
    cleanups: usize,
}

impl Backend for FixedDir {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn open(&mut self) -> TestbedResult<String> {
        self.opened = true;
        Ok(self.dir.display().to_string())
    }

    fn capabilities(&self) -> Vec<String> {
        vec![format!("downtmp-host={}", self.dir.display())]
    }

    fn execute_prefix(&self) -> Vec<String> {
        Vec::new()
    }

    fn cleanup(&mut self) -> TestbedResult<()> {
        if self.opened {
            self.opened = false;
            self.cleanups += 1;
        }
        Ok(())
    }
}

fn serve<B: Backend>(server: &mut Server<B>, requests: &[String]) -> (i32, Vec<String>) {
    let input = requests.join("\n") + "\n";
    let mut output = Vec::new();
    let status = server.run(Cursor::new(input), &mut output);
    let lines = String::from_utf8(output)
        .expect("utf-8 replies")
        .lines()
        .map(str::to_string)
        .collect();
    (status, lines)
}

fn fixed_server(dir: &TempDir) -> Server<FixedDir> {
    Server::new(FixedDir {
        dir: dir.path().to_path_buf(),
        opened: false,
        cleanups: 0,
    })
}

#[test]
fn banner_then_replies_in_order() {
    let dir = TempDir::new().expect("tempdir");
    let mut server = fixed_server(&dir);
    let requests = vec![
        "open".to_string(),
        "capabilities".to_string(),
        "print-execute-command".to_string(),
        encode_request("downtmp", &["build"]),
        "quit".to_string(),
    ];
    let (status, lines) = serve(&mut server, &requests);
    assert_eq!(status, EXIT_QUIT);
    assert_eq!(lines[0], "ok");
    let open = parse_reply(&lines[1]).expect("open reply");
    assert_eq!(open.fields, vec![dir.path().display().to_string()]);
    assert!(lines[2].starts_with("ok downtmp-host%3D"));
    assert_eq!(lines[3].trim_end(), "ok");
    let downtmp = parse_reply(&lines[4]).expect("downtmp reply");
    assert_eq!(downtmp.fields, vec![format!("{}/build", dir.path().display())]);
    assert!(dir.path().join("build").is_dir());
    assert_eq!(lines.len(), 5);
    assert_eq!(server.backend.cleanups, 1);
}

#[test]
fn request_errors_use_the_right_keyword() {
    let dir = TempDir::new().expect("tempdir");
    let mut server = fixed_server(&dir);
    let requests = vec![
        "capabilities".to_string(),
        "frobnicate".to_string(),
        "open".to_string(),
        "open".to_string(),
        "revert".to_string(),
        "downtmp".to_string(),
        encode_request("downtmp", &["../escape"]),
        "quit".to_string(),
    ];
    let (status, lines) = serve(&mut server, &requests);
    assert_eq!(status, EXIT_QUIT);
    let statuses: Vec<ReplyStatus> = lines[1..]
        .iter()
        .map(|line| parse_reply(line).expect("reply").status)
        .collect();
    assert_eq!(
        statuses,
        vec![
            ReplyStatus::BadPkg,
            ReplyStatus::BadPkg,
            ReplyStatus::Ok,
            ReplyStatus::Error,
            ReplyStatus::Error,
            ReplyStatus::BadPkg,
            ReplyStatus::BadPkg,
        ]
    );
}

#[test]
fn copies_files_and_directories_both_ways() {
    let scratch = TempDir::new().expect("scratch");
    let host = TempDir::new().expect("host");
    let src = host.path().join("src");
    std::fs::create_dir_all(src.join("sub")).expect("mkdir");
    std::fs::write(src.join("a.txt"), "alpha\n").expect("write");
    std::fs::write(src.join("sub/b.txt"), "beta\n").expect("write");
    let single = host.path().join("single.txt");
    std::fs::write(&single, "solo").expect("write");

    let tb_tree = format!("{}/tree/", scratch.path().display());
    let tb_single = format!("{}/single.txt", scratch.path().display());
    let back_tree = host.path().join("back");
    let back_single = host.path().join("nested/single.txt");

    let mut server = fixed_server(&scratch);
    let requests = vec![
        "open".to_string(),
        encode_request("copydown", &[&format!("{}/", src.display()), &tb_tree]),
        encode_request("copydown", &[&single.display().to_string(), &tb_single]),
        encode_request(
            "copyup",
            &[&tb_tree, &format!("{}/", back_tree.display())],
        ),
        encode_request("copyup", &[&tb_single, &back_single.display().to_string()]),
        encode_request("copyup", &[&tb_tree, "/no/trailing/slash"]),
    ];
    let (status, lines) = serve(&mut server, &requests);
    assert_eq!(status, EXIT_QUIT);
    assert!(lines[1].starts_with("ok "), "{lines:?}");
    for line in &lines[2..6] {
        assert_eq!(line.trim_end(), "ok", "{lines:?}");
    }
    assert!(lines[6].starts_with("bad-pkg"), "{}", lines[6]);
    assert_eq!(
        std::fs::read_to_string(back_tree.join("sub/b.txt")).expect("read"),
        "beta\n"
    );
    assert_eq!(std::fs::read_to_string(back_single).expect("read"), "solo");
}

#[test]
fn execute_runs_with_host_file_stdio() {
    let scratch = TempDir::new().expect("scratch");
    let host = TempDir::new().expect("host");
    let stdin = host.path().join("in");
    let stdout = host.path().join("out");
    let stderr = host.path().join("err");
    std::fs::write(&stdin, "from stdin\n").expect("write");
    let argv = vec![
        "sh".to_string(),
        "-c".to_string(),
        "cat; pwd >&2; exit 7".to_string(),
    ];
    let word = encode_argv(&argv);
    let cwd = scratch.path().display().to_string();
    let mut server = fixed_server(&scratch);
    let (_, lines) = serve(
        &mut server,
        &[
            "open".to_string(),
            encode_request(
                "execute",
                &[
                    &word,
                    &stdin.display().to_string(),
                    &stdout.display().to_string(),
                    &stderr.display().to_string(),
                    &cwd,
                ],
            ),
        ],
    );
    assert_eq!(lines[2], "ok 7");
    assert_eq!(std::fs::read_to_string(stdout).expect("read"), "from stdin\n");
    let err = std::fs::read_to_string(stderr).expect("read");
    assert_eq!(
        PathBuf::from(err.trim()).canonicalize().expect("canonical"),
        scratch.path().canonicalize().expect("canonical")
    );
}

#[test]
fn null_backend_scratch_is_removed_at_end_of_input() {
    let mut server = Server::new(NullBackend::new());
    let (status, lines) = serve(&mut server, &["open".to_string()]);
    assert_eq!(status, EXIT_QUIT);
    let scratch = parse_reply(&lines[1]).expect("reply").fields.remove(0);
    assert!(!std::path::Path::new(&scratch).exists());
}
