//! End-to-end conversations through the full pipeline with mock engines.

use std::sync::Arc;
use std::time::{Duration, Instant};
use voxturn::audio::playback::{CollectorOutput, OutputRecord, WavFileOutput};
use voxturn::generation::{HistoryEntry, ScriptedGenerator};
use voxturn::stt::MockRecognizer;
use voxturn::synthesis::MockSynthesizer;
use voxturn::{Pipeline, PipelineConfig, PipelineEvent, PipelineHandle, SessionState};

const ONE_SECOND: usize = 16000;

fn json_units(texts: &[&str]) -> Vec<String> {
    texts
        .iter()
        .map(|t| format!("{{\"text\":\"{}\"}}", t))
        .collect()
}

fn start(
    recognizer: MockRecognizer,
    generator: ScriptedGenerator,
    synthesizer: MockSynthesizer,
    output: Box<dyn voxturn::AudioOutput>,
) -> PipelineHandle {
    Pipeline::new(PipelineConfig::default())
        .start(
            Arc::new(recognizer),
            Arc::new(generator),
            Arc::new(synthesizer),
            output,
        )
        .unwrap()
}

fn speak(handle: &PipelineHandle) {
    assert!(handle.push_audio(vec![8000; ONE_SECOND]));
    assert!(handle.end_of_turn());
}

/// Collect events until `done` matches one; panics after `timeout`.
fn collect_until(
    handle: &PipelineHandle,
    timeout: Duration,
    mut done: impl FnMut(&PipelineEvent) -> bool,
) -> Vec<PipelineEvent> {
    let deadline = Instant::now() + timeout;
    let mut events = Vec::new();
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        let Ok(event) = handle.events().recv_timeout(left) else {
            break;
        };
        let stop = done(&event);
        events.push(event);
        if stop {
            return events;
        }
    }
    panic!("timed out waiting for event; saw {:?}", events);
}

fn is_idle_after(turn: u64) -> impl FnMut(&PipelineEvent) -> bool {
    move |event| {
        matches!(
            event,
            PipelineEvent::StateChanged { to: SessionState::Idle, turn: t, .. } if *t == turn
        )
    }
}

fn chunk_seqs(events: &[PipelineEvent], turn: u64) -> Vec<u64> {
    events
        .iter()
        .filter_map(|event| match event {
            PipelineEvent::AudioChunk { turn: t, seq, .. } if *t == turn => Some(*seq),
            _ => None,
        })
        .collect()
}

#[test]
fn slow_first_fragment_still_plays_first() {
    let output = CollectorOutput::new();
    let handle = start(
        MockRecognizer::new("hola"),
        ScriptedGenerator::new(&json_units(&["uno", "dos"])),
        MockSynthesizer::new().with_delay_for("uno", Duration::from_millis(150)),
        Box::new(output.clone()),
    );

    speak(&handle);
    let events = collect_until(&handle, Duration::from_secs(5), is_idle_after(1));

    assert_eq!(output.chunks(), vec![b"uno".to_vec(), b"dos".to_vec()]);
    assert_eq!(chunk_seqs(&events, 1), vec![1, 2]);
    let stopped = events
        .iter()
        .position(|e| *e == PipelineEvent::SpeakingStopped { turn: 1 })
        .unwrap();
    let last_chunk = events
        .iter()
        .rposition(|e| matches!(e, PipelineEvent::AudioChunk { .. }))
        .unwrap();
    assert!(stopped > last_chunk);
    assert_eq!(output.records().last(), Some(&OutputRecord::Finished));
    handle.stop();
}

#[test]
fn failed_fragment_is_skipped_and_turn_completes() {
    let output = CollectorOutput::new();
    let handle = start(
        MockRecognizer::new("hola"),
        ScriptedGenerator::new(&json_units(&["uno", "dos", "tres"])),
        MockSynthesizer::new().with_failure_for("dos"),
        Box::new(output.clone()),
    );

    speak(&handle);
    let events = collect_until(&handle, Duration::from_secs(5), is_idle_after(1));

    assert_eq!(output.chunks(), vec![b"uno".to_vec(), b"tres".to_vec()]);
    assert_eq!(chunk_seqs(&events, 1), vec![1, 3]);
    assert!(events.contains(&PipelineEvent::SpeakingStopped { turn: 1 }));
    handle.stop();
}

#[test]
fn barge_in_cuts_reply_and_answers_new_turn() {
    let script: Vec<String> = (1..=30).map(|i| format!("{{\"text\":\"t{}\"}}", i)).collect();
    let output = CollectorOutput::new();
    let handle = start(
        MockRecognizer::new("hola"),
        ScriptedGenerator::new(&script).with_token_delay(Duration::from_millis(15)),
        MockSynthesizer::new().with_delay(Duration::from_millis(5)),
        Box::new(output.clone()),
    );

    speak(&handle);
    let mut events = collect_until(&handle, Duration::from_secs(5), |e| {
        *e == PipelineEvent::SpeakingStarted { turn: 1 }
    });
    speak(&handle);
    events.extend(collect_until(&handle, Duration::from_secs(10), is_idle_after(2)));

    let interrupted: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::StateChanged {
                to: SessionState::Interrupted,
                turn,
                ..
            } => Some(*turn),
            _ => None,
        })
        .collect();
    assert_eq!(interrupted, vec![1]);

    let stops = events
        .iter()
        .filter(|e| **e == PipelineEvent::SpeakingStopped { turn: 1 })
        .count();
    assert_eq!(stops, 1);

    // Nothing from the old turn plays after it was stopped.
    let stopped_at = events
        .iter()
        .position(|e| *e == PipelineEvent::SpeakingStopped { turn: 1 })
        .unwrap();
    assert!(chunk_seqs(&events[stopped_at..], 1).is_empty());
    assert!(chunk_seqs(&events, 1).len() < script.len());

    // The new turn plays in full and in order.
    let expected: Vec<u64> = (1..=script.len() as u64).collect();
    assert_eq!(chunk_seqs(&events, 2), expected);
    assert!(output.records().contains(&OutputRecord::Aborted));
    handle.stop();
}

#[test]
fn repeated_interrupt_acts_once() {
    let script: Vec<String> = (1..=50).map(|i| format!("{{\"text\":\"t{}\"}}", i)).collect();
    let output = CollectorOutput::new();
    let mut handle = start(
        MockRecognizer::new("hola"),
        ScriptedGenerator::new(&script).with_token_delay(Duration::from_millis(10)),
        MockSynthesizer::new(),
        Box::new(output.clone()),
    );

    speak(&handle);
    let mut events = collect_until(&handle, Duration::from_secs(5), |e| {
        *e == PipelineEvent::SpeakingStarted { turn: 1 }
    });
    assert!(handle.interrupt());
    assert!(handle.interrupt());
    handle.close_input();
    assert!(handle.wait(Duration::from_secs(5)));
    events.extend(handle.events().try_iter());

    let interrupted = events
        .iter()
        .filter(|e| {
            matches!(
                e,
                PipelineEvent::StateChanged {
                    to: SessionState::Interrupted,
                    ..
                }
            )
        })
        .count();
    assert_eq!(interrupted, 1);
    assert!(matches!(
        events.last(),
        Some(PipelineEvent::StateChanged {
            to: SessionState::Idle,
            turn: 2,
            ..
        })
    ));
    handle.stop();
}

#[test]
fn interrupt_while_idle_changes_nothing() {
    let output = CollectorOutput::new();
    let mut handle = start(
        MockRecognizer::new("hola"),
        ScriptedGenerator::new(&json_units(&["uno"])),
        MockSynthesizer::new(),
        Box::new(output.clone()),
    );

    assert!(handle.interrupt());
    handle.close_input();
    assert!(handle.wait(Duration::from_secs(5)));

    assert_eq!(handle.events().try_iter().count(), 0);
    assert!(output.records().is_empty());
    handle.stop();
}

#[test]
fn empty_transcript_starts_no_reply() {
    let generator = ScriptedGenerator::new(&json_units(&["uno"]));
    let stats = generator.stats();
    let output = CollectorOutput::new();
    let mut handle = start(
        MockRecognizer::new("[BLANK_AUDIO]"),
        generator,
        MockSynthesizer::new(),
        Box::new(output.clone()),
    );

    speak(&handle);
    handle.close_input();
    assert!(handle.wait(Duration::from_secs(5)));
    let events: Vec<PipelineEvent> = handle.events().try_iter().collect();

    assert!(events.contains(&PipelineEvent::Final {
        text: String::new()
    }));
    assert!(!events.iter().any(|e| matches!(
        e,
        PipelineEvent::StateChanged {
            to: SessionState::Generating,
            ..
        }
    )));
    assert_eq!(stats.opened(), 0);
    assert!(output.chunks().is_empty());
    handle.stop();
}

#[test]
fn generation_failure_ends_turn_without_audio() {
    let output = CollectorOutput::new();
    let handle = start(
        MockRecognizer::new("hola"),
        ScriptedGenerator::new(&json_units(&["uno"])).with_open_failure(),
        MockSynthesizer::new(),
        Box::new(output.clone()),
    );

    speak(&handle);
    let events = collect_until(&handle, Duration::from_secs(5), is_idle_after(1));

    assert!(events.contains(&PipelineEvent::StateChanged {
        from: SessionState::Listening,
        to: SessionState::Generating,
        turn: 1,
    }));
    assert!(!events
        .iter()
        .any(|e| matches!(e, PipelineEvent::SpeakingStarted { .. })));
    assert!(output.chunks().is_empty());
    handle.stop();
}

#[test]
fn wav_output_keeps_one_file_per_turn() {
    let dir = tempfile::tempdir().unwrap();
    let output = WavFileOutput::new(dir.path(), 16000).unwrap();
    let mut handle = start(
        MockRecognizer::new("hola"),
        ScriptedGenerator::new(&json_units(&["uno", "dos"])),
        MockSynthesizer::new(),
        Box::new(output),
    );

    speak(&handle);
    collect_until(&handle, Duration::from_secs(5), is_idle_after(1));
    speak(&handle);
    collect_until(&handle, Duration::from_secs(5), is_idle_after(2));
    handle.close_input();
    assert!(handle.wait(Duration::from_secs(5)));
    handle.stop();

    for name in ["turn-0001.wav", "turn-0002.wav"] {
        let reader = hound::WavReader::open(dir.path().join(name)).unwrap();
        assert_eq!(reader.spec().sample_rate, 16000);
        assert!(reader.len() > 0);
    }
}

#[test]
fn second_turn_carries_first_exchange_as_context() {
    let generator = ScriptedGenerator::new(&json_units(&["uno", "dos"]));
    let recorded = generator.clone();
    let mut handle = start(
        MockRecognizer::new("cuenta"),
        generator,
        MockSynthesizer::new(),
        Box::new(CollectorOutput::new()),
    );

    speak(&handle);
    collect_until(&handle, Duration::from_secs(5), is_idle_after(1));
    speak(&handle);
    collect_until(&handle, Duration::from_secs(5), is_idle_after(2));
    handle.stop();

    let requests = recorded.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].history.is_empty());
    assert_eq!(
        requests[1].history,
        vec![HistoryEntry::user("cuenta"), HistoryEntry::assistant("uno dos")]
    );
}
