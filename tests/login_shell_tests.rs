mod common;

use std::fs;
use std::sync::{Arc, Mutex};

use common::{ManualAuthenticator, TableAuthenticator, WireProbe, clear, pump, texts};
use outpost::auth::Authenticator;
use outpost::command::{CommandFactory, ShellParams};
use outpost::config::LoginConfig;
use outpost::events::{ControlEvent, Event, OutputEvent, OutputKind};
use outpost::filters::login::LoginFilter;
use outpost::scheduler::Scheduler;
use outpost::sessions::SessionRegistry;
use outpost::stream::{EventStream, StreamHandle};
use outpost::users::AccountType;
use tempfile::TempDir;

fn login_config() -> LoginConfig {
    LoginConfig {
        banner: "Welcome to the test server.".to_string(),
        timeout: std::time::Duration::from_secs(600),
        max_tries: 3,
    }
}

/// A stream wearing a wire probe and a login filter, with a sink that
/// authenticates and installs a shell on success.
fn login_session(
    authenticator: Arc<dyn Authenticator>,
    factory: Option<Arc<CommandFactory>>,
    log: Arc<Mutex<Vec<ControlEvent>>>,
) -> (EventStream, Arc<Mutex<Vec<OutputEvent>>>) {
    let mut stream = EventStream::new("login-test");
    let (probe, outputs) = WireProbe::new();

    stream.set_control_sink(Box::new(move |handle: &StreamHandle, event| {
        match &event {
            ControlEvent::LoginAuth(request) => authenticator.authenticate(request.clone()),
            ControlEvent::UserLogin { user } => {
                if let Some(factory) = &factory {
                    handle.add_filter(Box::new(factory.create_shell_for_user(user.clone())));
                }
            }
            // What the real server does: terminal failures and
            // logouts end the connection.
            ControlEvent::LoginFailure { fatal: true, .. } | ControlEvent::UserLogout { .. } => {
                handle.shutdown();
            }
            _ => {}
        }
        log.lock().unwrap().push(event);
    }));

    stream.add_filter(Box::new(probe));
    stream.add_filter(Box::new(LoginFilter::new(
        login_config(),
        Arc::new(Scheduler::new()),
    )));
    (stream, outputs)
}

fn factory_over(dir: &TempDir) -> Arc<CommandFactory> {
    CommandFactory::new(
        vec![dir.path().to_path_buf()],
        ShellParams::default(),
        Arc::new(SessionRegistry::new()),
    )
    .unwrap()
}

#[test]
fn telnet_login_happy_path() {
    let auth =
        Arc::new(TableAuthenticator::new().with_user("alice", "secret", AccountType::User));
    let log = Arc::new(Mutex::new(Vec::new()));
    let (mut stream, outputs) = login_session(auth, None, log.clone());

    pump(&mut [&mut stream]);
    let seen = texts(&outputs);
    assert!(seen.iter().any(|t| t.contains("Welcome")));
    assert!(seen.iter().any(|t| t == "Username: "));

    stream.handle().inject_input(vec![Event::input("alice")]);
    pump(&mut [&mut stream]);
    let hidden = outputs
        .lock()
        .unwrap()
        .iter()
        .any(|o| o.kind == OutputKind::HiddenPrompt && o.data == "Password: ");
    assert!(hidden, "password prompt must mask echo");

    stream.handle().inject_input(vec![Event::input("secret")]);
    pump(&mut [&mut stream]);

    let logins: Vec<String> = log
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            ControlEvent::UserLogin { user } => Some(user.username.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(logins, vec!["alice"]);
}

#[test]
fn failed_attempts_reprompt_until_exhausted() {
    let auth = Arc::new(TableAuthenticator::new().with_user("bob", "right", AccountType::User));
    let log = Arc::new(Mutex::new(Vec::new()));
    let (mut stream, outputs) = login_session(auth, None, log.clone());

    for _ in 0..3 {
        stream.handle().inject_input(vec![Event::input("bob")]);
        pump(&mut [&mut stream]);
        stream.handle().inject_input(vec![Event::input("wrong")]);
        pump(&mut [&mut stream]);
    }

    let fatal = log.lock().unwrap().iter().any(|e| {
        matches!(e, ControlEvent::LoginFailure { fatal: true, .. })
    });
    assert!(fatal, "third failure must be terminal");
    assert!(stream.is_finalized());
    assert!(texts(&outputs).iter().any(|t| t.contains("Too many")));
}

#[test]
fn late_success_after_exhaustion_is_rejected() {
    let auth = Arc::new(ManualAuthenticator::new());
    let log = Arc::new(Mutex::new(Vec::new()));
    let manual = auth.clone();
    let (mut stream, _outputs) = login_session(auth, None, log.clone());

    // Burn through every attempt with manual failures.
    let mut last_request = None;
    for _ in 0..3 {
        stream.handle().inject_input(vec![Event::input("carol")]);
        pump(&mut [&mut stream]);
        stream.handle().inject_input(vec![Event::input("pw")]);
        pump(&mut [&mut stream]);

        let request = manual.take_last().expect("auth request expected");
        (request.on_failure)("bad password".to_string());
        last_request = Some(request);
        pump(&mut [&mut stream]);
    }
    assert!(stream.is_finalized(), "session must already be over");

    // The authenticator answers once more, too late.
    let user = Arc::new(
        outpost::users::User::new("carol".to_string(), "pw", AccountType::User).unwrap(),
    );
    (last_request.unwrap().on_success)(user);
    pump(&mut [&mut stream]);

    let logins = log
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, ControlEvent::UserLogin { .. }))
        .count();
    assert_eq!(logins, 0, "late success must not produce a login");
}

#[test]
fn shell_dispatches_commands_after_login() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("test.cmd"),
        "= status\n== code\n  echo\n  All systems nominal.\n= statistics\n== code\n  echo\n  Numbers!\n",
    )
    .unwrap();

    let auth = Arc::new(TableAuthenticator::new().with_user("dave", "pw", AccountType::User));
    let factory = factory_over(&dir);
    let log = Arc::new(Mutex::new(Vec::new()));
    let (mut stream, outputs) = login_session(auth, Some(factory), log);

    stream.handle().inject_input(vec![Event::input("dave")]);
    pump(&mut [&mut stream]);
    stream.handle().inject_input(vec![Event::input("pw")]);
    pump(&mut [&mut stream]);
    clear(&outputs);

    // Exact command.
    stream.handle().inject_input(vec![Event::input("/status")]);
    pump(&mut [&mut stream]);
    let seen = texts(&outputs);
    assert!(seen.iter().any(|t| t == "All systems nominal."));
    // Followed by a prompt.
    assert!(
        outputs
            .lock()
            .unwrap()
            .iter()
            .any(|o| o.kind == OutputKind::Prompt),
        "a prompt must follow each input"
    );

    // Ambiguous prefix.
    clear(&outputs);
    stream.handle().inject_input(vec![Event::input("/stat")]);
    pump(&mut [&mut stream]);
    let seen = texts(&outputs);
    assert!(
        seen.iter()
            .any(|t| t == "Ambiguous command 'stat': Matches [statistics, status]"),
        "got: {:?}",
        seen
    );

    // Unknown command.
    clear(&outputs);
    stream.handle().inject_input(vec![Event::input("/warp")]);
    pump(&mut [&mut stream]);
    assert!(texts(&outputs).iter().any(|t| t == "No such command 'warp'"));

    // Unprefixed input keeps climbing and hits the brushoff.
    clear(&outputs);
    stream.handle().inject_input(vec![Event::input("dance")]);
    pump(&mut [&mut stream]);
    assert!(texts(&outputs).iter().any(|t| t.contains("dance")));
}

#[test]
fn restricted_commands_are_denied() {
    let dir = TempDir::new().unwrap();
    let auth = Arc::new(TableAuthenticator::new().with_user("eve", "pw", AccountType::User));
    let factory = factory_over(&dir);
    let log = Arc::new(Mutex::new(Vec::new()));
    let (mut stream, outputs) = login_session(auth, Some(factory), log);

    stream.handle().inject_input(vec![Event::input("eve")]);
    pump(&mut [&mut stream]);
    stream.handle().inject_input(vec![Event::input("pw")]);
    pump(&mut [&mut stream]);
    clear(&outputs);

    // `shutdown` is admin-only and filtered out of eve's table.
    stream.handle().inject_input(vec![Event::input("/shutdown")]);
    pump(&mut [&mut stream]);
    assert!(
        texts(&outputs)
            .iter()
            .any(|t| t == "No such command 'shutdown'")
    );
}

#[test]
fn hot_reload_swaps_tables_in_live_shells() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("a.cmd"),
        "= foo\n== code\n  echo\n  foo lives\n",
    )
    .unwrap();

    let auth = Arc::new(TableAuthenticator::new().with_user("finn", "pw", AccountType::User));
    let factory = factory_over(&dir);
    let log = Arc::new(Mutex::new(Vec::new()));
    let (mut stream, outputs) = login_session(auth, Some(factory.clone()), log);

    stream.handle().inject_input(vec![Event::input("finn")]);
    pump(&mut [&mut stream]);
    stream.handle().inject_input(vec![Event::input("pw")]);
    pump(&mut [&mut stream]);
    clear(&outputs);

    stream.handle().inject_input(vec![Event::input("/foo")]);
    pump(&mut [&mut stream]);
    assert!(texts(&outputs).iter().any(|t| t == "foo lives"));

    // Edit the file: foo out, bar in. Wait past mtime granularity so
    // the scan sees the change.
    std::thread::sleep(std::time::Duration::from_millis(30));
    fs::write(
        dir.path().join("a.cmd"),
        "= bar\n== code\n  echo\n  bar lives\n",
    )
    .unwrap();
    factory.rebuild().unwrap();

    assert!(factory.command("foo").is_none());
    assert!(factory.command("bar").is_some());

    // The live shell swaps tables on its next input.
    clear(&outputs);
    stream.handle().inject_input(vec![Event::input("/foo")]);
    pump(&mut [&mut stream]);
    assert!(texts(&outputs).iter().any(|t| t == "No such command 'foo'"));

    clear(&outputs);
    stream.handle().inject_input(vec![Event::input("/bar")]);
    pump(&mut [&mut stream]);
    assert!(texts(&outputs).iter().any(|t| t == "bar lives"));
}

#[test]
fn quit_logs_out_and_tears_down() {
    let dir = TempDir::new().unwrap();
    let auth = Arc::new(TableAuthenticator::new().with_user("gail", "pw", AccountType::User));
    let factory = factory_over(&dir);
    let log = Arc::new(Mutex::new(Vec::new()));
    let (mut stream, outputs) = login_session(auth, Some(factory), log.clone());

    stream.handle().inject_input(vec![Event::input("gail")]);
    pump(&mut [&mut stream]);
    stream.handle().inject_input(vec![Event::input("pw")]);
    pump(&mut [&mut stream]);

    stream.handle().inject_input(vec![Event::input("/quit")]);
    pump(&mut [&mut stream]);

    assert!(texts(&outputs).iter().any(|t| t.contains("Goodbye")));
    let logout = log
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, ControlEvent::UserLogout { .. }));
    assert!(logout);
    assert!(stream.is_finalized());
}

#[test]
fn registry_round_trip_for_admin() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("extra.cmd"),
        "= lowly\n== restriction\n  user\n== code\n  echo\n  hi\n= lofty\n== restriction\n  admin\n== code\n  echo\n  hi\n",
    )
    .unwrap();

    let factory = factory_over(&dir);
    let admin = outpost::users::User::new("root".to_string(), "pw", AccountType::Admin).unwrap();
    let available = factory.commands_available_to(&admin);

    // Everything registered with restriction <= admin comes back.
    assert!(available.iter().any(|c| c.name == "lowly"));
    assert!(available.iter().any(|c| c.name == "lofty"));
    for command in &available {
        assert!(command.restriction <= AccountType::Admin);
    }
}
