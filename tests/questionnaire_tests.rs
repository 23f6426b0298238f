mod common;

use std::sync::{Arc, Mutex};

use common::{WireProbe, clear, pump, texts};
use outpost::events::{Event, OutputKind};
use outpost::filters::questionnaire::{
    AnswerValue, ProcOutcome, QuestionnaireFilter, RestartHandle, Step,
};
use outpost::stream::EventStream;

fn questionnaire_session(
    q: QuestionnaireFilter,
) -> (
    EventStream,
    Arc<Mutex<Vec<outpost::events::OutputEvent>>>,
) {
    let mut stream = EventStream::new("questionnaire");
    let (probe, outputs) = WireProbe::new();
    stream.add_filter(Box::new(probe));
    stream.add_filter(Box::new(q));
    (stream, outputs)
}

#[test]
fn map_validator_dialog() {
    let answers = Arc::new(Mutex::new(None));
    let seen = answers.clone();

    let q = QuestionnaireFilter::new(
        "favorite-color",
        vec![
            Step::new("color")
                .prompt("Favorite color? ")
                .map([("r", "red"), ("g", "green")])
                .error_message("Pick r or g."),
        ],
    )
    .with_finalizer(move |q| {
        *seen.lock().unwrap() = q.answer("color").cloned();
        Vec::new()
    });

    let (mut stream, outputs) = questionnaire_session(q);
    pump(&mut [&mut stream]);
    assert!(texts(&outputs).iter().any(|t| t == "Favorite color? "));

    // A miss: error plus re-ask, no answer yet.
    clear(&outputs);
    stream.handle().inject_input(vec![Event::input("x")]);
    pump(&mut [&mut stream]);
    let seen_texts = texts(&outputs);
    assert!(seen_texts.iter().any(|t| t == "Pick r or g."));
    assert!(seen_texts.iter().any(|t| t == "Favorite color? "));
    assert!(answers.lock().unwrap().is_none());

    // A hit: the mapped value lands in the answers.
    stream.handle().inject_input(vec![Event::input("g")]);
    pump(&mut [&mut stream]);
    assert_eq!(
        *answers.lock().unwrap(),
        Some(AnswerValue::Text("green".to_string()))
    );
}

#[test]
fn multi_step_dialog_collects_in_order() {
    let result = Arc::new(Mutex::new(Vec::new()));
    let seen = result.clone();

    let q = QuestionnaireFilter::new(
        "signup",
        vec![
            Step::new("name").prompt("Name? "),
            Step::new("quest").prompt("Quest? "),
            Step::new("velocity")
                .prompt("Velocity? ")
                .default_value("unladen"),
        ],
    )
    .with_finalizer(move |q| {
        for step in ["name", "quest", "velocity"] {
            if let Some(AnswerValue::Text(text)) = q.answer(step) {
                seen.lock().unwrap().push(text.clone());
            }
        }
        vec![Event::output("Done!")]
    });

    let (mut stream, outputs) = questionnaire_session(q);
    pump(&mut [&mut stream]);

    for answer in ["arthur", "grail", ""] {
        stream.handle().inject_input(vec![Event::input(answer)]);
        pump(&mut [&mut stream]);
    }

    assert_eq!(*result.lock().unwrap(), vec!["arthur", "grail", "unladen"]);
    assert!(texts(&outputs).iter().any(|t| t == "Done!"));
    // The finalizer ran and the questionnaire left the chain; the two
    // defaults and the probe remain.
    assert_eq!(stream.filter_count(), 3);
}

#[test]
fn hidden_steps_prompt_hidden() {
    let q = QuestionnaireFilter::new(
        "secrets",
        vec![Step::new("passphrase").prompt("Passphrase: ").hidden()],
    );
    let (mut stream, outputs) = questionnaire_session(q);
    pump(&mut [&mut stream]);

    assert!(
        outputs
            .lock()
            .unwrap()
            .iter()
            .any(|o| o.kind == OutputKind::HiddenPrompt && o.data == "Passphrase: ")
    );
}

#[test]
fn outside_output_is_delayed_until_the_end() {
    let q = QuestionnaireFilter::new("delay", vec![Step::new("only").prompt("? ")]);
    let (mut stream, outputs) = questionnaire_session(q);
    pump(&mut [&mut stream]);
    clear(&outputs);

    // World chatter arrives mid-dialog: held.
    stream
        .handle()
        .inject_output(vec![Event::output("world tick")]);
    pump(&mut [&mut stream]);
    assert!(!texts(&outputs).iter().any(|t| t == "world tick"));

    // Dialog ends: the held output is released.
    stream.handle().inject_input(vec![Event::input("done")]);
    pump(&mut [&mut stream]);
    assert!(texts(&outputs).iter().any(|t| t == "world tick"));
}

#[test]
fn blocking_step_pauses_and_restarts() {
    let handle_slot: Arc<Mutex<Option<RestartHandle>>> = Arc::new(Mutex::new(None));
    let stash = handle_slot.clone();
    let verdict = Arc::new(Mutex::new(None));
    let seen = verdict.clone();

    let q = QuestionnaireFilter::new(
        "approval",
        vec![
            Step::new("request")
                .prompt("Request? ")
                .blocking()
                .validate_with(move |q, _data| {
                    // Park the dialog on an external decision.
                    *stash.lock().unwrap() = q.restart_handle();
                    ProcOutcome::Block
                }),
        ],
    )
    .with_finalizer(move |q| {
        *seen.lock().unwrap() = q.answer("request").cloned();
        Vec::new()
    });

    let (mut stream, _outputs) = questionnaire_session(q);
    pump(&mut [&mut stream]);

    stream.handle().inject_input(vec![Event::input("more power")]);
    pump(&mut [&mut stream]);

    // Blocked: the stream is paused and nothing was answered.
    assert!(stream.is_paused());
    assert!(verdict.lock().unwrap().is_none());
    let restart = handle_slot.lock().unwrap().take().expect("restart handle");

    // The external decision arrives.
    restart.restart(AnswerValue::Text("granted".to_string()));
    pump(&mut [&mut stream]);

    assert!(!stream.is_paused());
    assert_eq!(
        *verdict.lock().unwrap(),
        Some(AnswerValue::Text("granted".to_string()))
    );
}

#[test]
fn snoop_mirrors_both_directions() {
    use outpost::filters::snoop::SnoopFilter;

    // Target session.
    let mut target = EventStream::new("target");
    let (target_probe, target_out) = WireProbe::new();
    target.add_filter(Box::new(target_probe));

    // Watcher session snooping the target.
    let mut watcher = EventStream::new("watcher");
    let (watcher_probe, watcher_out) = WireProbe::new();
    watcher.add_filter(Box::new(watcher_probe));
    let (snoop, _control) = SnoopFilter::new("t", target.handle(), false);
    watcher.add_filter(Box::new(snoop));
    pump(&mut [&mut watcher, &mut target]);
    clear(&watcher_out);
    clear(&target_out);

    // Target types something; the watcher sees the keyed copy.
    target.handle().inject_input(vec![Event::input("hello")]);
    pump(&mut [&mut target, &mut watcher]);
    assert!(
        texts(&watcher_out)
            .iter()
            .any(|t| t == "@t [Input]: hello"),
        "got {:?}",
        texts(&watcher_out)
    );

    // Server output to the target is mirrored too.
    target.handle().inject_output(vec![Event::output("Hi")]);
    pump(&mut [&mut target, &mut watcher]);
    assert!(texts(&watcher_out).iter().any(|t| t == "@t [Output]: Hi"));

    // Prompts are terminal control and never mirrored.
    clear(&watcher_out);
    target
        .handle()
        .inject_output(vec![Event::Output(outpost::events::OutputEvent::prompt(
            "> ",
        ))]);
    pump(&mut [&mut target, &mut watcher]);
    assert!(texts(&watcher_out).is_empty());

    // Keyed watcher input is rerouted into the target's input side;
    // nothing above consumes it there, so the target's brushoff quotes
    // it back.
    clear(&target_out);
    watcher
        .handle()
        .inject_input(vec![Event::input("@t tell me more")]);
    pump(&mut [&mut watcher, &mut target]);
    assert!(
        texts(&target_out).iter().any(|t| t.contains("tell me more")),
        "got {:?}",
        texts(&target_out)
    );
}
