// SPDX-License-Identifier: MPL-2.0

use either::*;

use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rsaggregator::aggregator::Settings;
use rsaggregator::{
    Aggregator, AggregatorImpl, AggregatorPad, AggregatorState, Buffer, BufferFlags, Caps,
    Downstream, Error, Event, EventType, EventView, FlowError, FlowResult, FlowSuccess,
    LatencyQuery, Query, Segment, StartTimeSelection, TagList, TestClock, Upstream,
};

const TIMEOUT: Duration = Duration::from_secs(5);
const MS: Duration = Duration::from_millis(1);

fn init() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

#[derive(Debug)]
struct Aggregated {
    timeout: bool,
    peeked: Vec<Option<Buffer>>,
}

#[derive(Default)]
struct Options {
    reject_caps: bool,
    /// Output position for live operation, advanced by 100ms per aggregate call.
    live_position: Option<Duration>,
    /// Use the output segment position as deadline.
    segment_next_time: bool,
    /// Skip buffers before this PTS in live mode, reporting them on the sender.
    skip_before: Option<(Duration, mpsc::Sender<Buffer>)>,
}

struct TestAggregator {
    sender: Mutex<mpsc::Sender<Aggregated>>,
    reject_caps: bool,
    position: Option<Mutex<Duration>>,
    segment_next_time: bool,
    skip_before: Option<(Duration, Mutex<mpsc::Sender<Buffer>>)>,
}

impl AggregatorImpl for TestAggregator {
    fn aggregate(&self, aggregator: &Aggregator, timeout: bool) -> FlowResult {
        let pads = aggregator.pads();
        let peeked = pads.iter().map(|pad| pad.peek_buffer()).collect::<Vec<_>>();

        if peeked.iter().all(Option::is_none) && pads.iter().all(|pad| pad.is_eos()) {
            return Err(FlowError::Eos);
        }

        let _ = self.sender.lock().unwrap().send(Aggregated { timeout, peeked });

        if aggregator.current_caps().is_none() {
            aggregator.set_src_caps(Caps::new("test/x-raw"));
        }

        if let Some(position) = &self.position {
            *position.lock().unwrap() += 100 * MS;
        }

        let mut buffers = pads
            .iter()
            .filter_map(|pad| pad.pop_buffer())
            .collect::<Vec<_>>();

        match buffers.len() {
            0 => Ok(FlowSuccess::NeedData),
            1 => aggregator.finish_buffer(buffers.remove(0)),
            _ => {
                let pts = buffers[0].pts();
                let data = buffers
                    .iter()
                    .flat_map(|buffer| buffer.data().iter().copied())
                    .collect::<Vec<_>>();
                let mut outbuf = Buffer::from_vec(data);
                outbuf.set_pts(pts);
                aggregator.finish_buffer(outbuf)
            }
        }
    }

    fn next_time(&self, aggregator: &Aggregator) -> Option<Duration> {
        match &self.position {
            Some(position) => Some(*position.lock().unwrap()),
            None if self.segment_next_time => aggregator.simple_next_time(),
            None => aggregator.parent_next_time(),
        }
    }

    fn skip_buffer(&self, _aggregator: &Aggregator, _pad: &AggregatorPad, buffer: &Buffer) -> bool {
        let Some((before, sender)) = &self.skip_before else {
            return false;
        };

        let skip = buffer.pts().is_some_and(|pts| pts < *before);
        if skip {
            let _ = sender.lock().unwrap().send(buffer.clone());
        }
        skip
    }

    fn sink_event(&self, aggregator: &Aggregator, pad: &AggregatorPad, event: Event) -> bool {
        if self.reject_caps && event.type_() == EventType::Caps {
            return false;
        }

        aggregator.parent_sink_event(pad, event)
    }
}

struct Collector {
    sender: Mutex<mpsc::Sender<Either<Buffer, Event>>>,
}

impl Downstream for Collector {
    fn chain(&self, buffer: Buffer) -> FlowResult {
        let _ = self.sender.lock().unwrap().send(Left(buffer));
        Ok(FlowSuccess::Ok)
    }

    fn event(&self, event: Event) -> bool {
        let _ = self.sender.lock().unwrap().send(Right(event));
        true
    }

    fn query(&self, query: &mut Query) -> bool {
        match query {
            Query::Custom { result, .. } => {
                *result = Some("answered".into());
                true
            }
            _ => false,
        }
    }
}

struct LiveUpstream {
    min: Duration,
    max: Option<Duration>,
}

impl Upstream for LiveUpstream {
    fn query(&self, query: &mut Query) -> bool {
        match query {
            Query::Latency(latency) => {
                latency.live = true;
                latency.min = self.min;
                latency.max = self.max;
                true
            }
            _ => false,
        }
    }
}

struct SeekHandler {
    sender: Mutex<mpsc::Sender<Event>>,
}

impl Upstream for SeekHandler {
    fn event(&self, event: Event) -> bool {
        let handled = event.type_() == EventType::Seek;
        let _ = self.sender.lock().unwrap().send(event);
        handled
    }
}

fn setup(
    settings: Settings,
    options: Options,
    n_pads: usize,
) -> (
    Aggregator,
    Vec<AggregatorPad>,
    mpsc::Receiver<Aggregated>,
    mpsc::Receiver<Either<Buffer, Event>>,
) {
    init();

    let (sender_aggregated, receiver_aggregated) = mpsc::channel();
    let (sender_output, receiver_output) = mpsc::channel();

    let agg = Aggregator::new(
        "test-aggregator",
        TestAggregator {
            sender: Mutex::new(sender_aggregated),
            reject_caps: options.reject_caps,
            position: options.live_position.map(Mutex::new),
            segment_next_time: options.segment_next_time,
            skip_before: options
                .skip_before
                .map(|(before, sender)| (before, Mutex::new(sender))),
        },
        settings,
    );
    agg.set_downstream(Arc::new(Collector {
        sender: Mutex::new(sender_output),
    }));

    let pads = (0..n_pads)
        .map(|_| agg.request_pad(None).unwrap())
        .collect::<Vec<_>>();

    (agg, pads, receiver_aggregated, receiver_output)
}

fn start_stream(pad: &AggregatorPad) {
    assert!(pad.send_event(Event::stream_start(format!("{}-stream", pad.name()))));
    assert!(pad.send_event(Event::segment(Segment::new())));
}

fn buffer(data: &[u8], pts: Duration) -> Buffer {
    let mut buffer = Buffer::from_slice(data);
    buffer.set_pts(pts);
    buffer.set_duration(100 * MS);
    buffer
}

fn expect_event(receiver: &mpsc::Receiver<Either<Buffer, Event>>, type_: EventType) -> Event {
    match receiver.recv_timeout(TIMEOUT).unwrap() {
        Right(event) => {
            assert_eq!(event.type_(), type_, "unexpected event {event:?}");
            event
        }
        Left(buffer) => panic!("expected {type_:?} event, got {buffer:?}"),
    }
}

fn expect_buffer(receiver: &mpsc::Receiver<Either<Buffer, Event>>) -> Buffer {
    match receiver.recv_timeout(TIMEOUT).unwrap() {
        Left(buffer) => buffer,
        Right(event) => panic!("expected buffer, got {event:?}"),
    }
}

/// Waits until the earliest wait on `clock` is the one for `time`.
fn wait_for_clock_wait(clock: &TestClock, time: Duration) {
    let deadline = Instant::now() + TIMEOUT;
    while clock.wait_for_pending_id_timeout(TIMEOUT) != Some(time) {
        assert!(
            Instant::now() < deadline,
            "no wait for {time:?}, pending {:?}",
            clock.wait_for_pending_id_timeout(Duration::ZERO)
        );
        thread::sleep(10 * MS);
    }
}

fn wait_for_state(agg: &Aggregator, state: AggregatorState) {
    let deadline = Instant::now() + TIMEOUT;
    while agg.state() != state {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {state:?}, currently {:?}",
            agg.state()
        );
        thread::sleep(10 * MS);
    }
}

#[test]
fn waits_for_all_inputs() {
    let (agg, pads, aggregated, output) = setup(Settings::default(), Options::default(), 3);
    agg.start().unwrap();
    assert_eq!(agg.state(), AggregatorState::Running);

    for pad in &pads {
        start_stream(pad);
    }

    pads[0].chain(buffer(b"a", Duration::ZERO)).unwrap();
    pads[1].chain(buffer(b"b", Duration::ZERO)).unwrap();
    assert!(aggregated.recv_timeout(200 * MS).is_err());

    pads[2].chain(buffer(b"c", Duration::ZERO)).unwrap();
    let res = aggregated.recv_timeout(TIMEOUT).unwrap();
    assert!(!res.timeout);
    assert_eq!(res.peeked.len(), 3);
    for (peeked, data) in res.peeked.iter().zip([b"a", b"b", b"c"]) {
        assert_eq!(peeked.as_ref().unwrap().data(), data);
    }

    // Nothing left to aggregate
    assert!(aggregated.recv_timeout(200 * MS).is_err());

    expect_event(&output, EventType::StreamStart);
    expect_event(&output, EventType::Caps);
    expect_event(&output, EventType::Segment);
    assert_eq!(expect_buffer(&output).data(), b"abc");

    agg.stop();
    assert_eq!(agg.state(), AggregatorState::Stopped);
}

#[test]
fn mandatory_events_and_eos() {
    let (agg, pads, _aggregated, output) = setup(Settings::default(), Options::default(), 2);
    agg.start().unwrap();

    for pad in &pads {
        start_stream(pad);
        pad.chain(buffer(b"x", Duration::ZERO)).unwrap();
        assert!(pad.send_event(Event::eos()));
    }

    expect_event(&output, EventType::StreamStart);
    let caps = expect_event(&output, EventType::Caps);
    assert_eq!(agg.current_caps().as_ref(), match caps.view() {
        EventView::Caps(caps) => Some(caps),
        _ => unreachable!(),
    });
    let segment = expect_event(&output, EventType::Segment);
    assert_eq!(expect_buffer(&output).data(), b"xx");
    let eos = expect_event(&output, EventType::Eos);

    // EOS continues the sequence of the segment
    assert_eq!(eos.seqnum(), segment.seqnum());
    assert!(output.recv_timeout(200 * MS).is_err());

    wait_for_state(&agg, AggregatorState::Started);
    assert_eq!(
        pads[0].chain(buffer(b"late", Duration::ZERO)),
        Err(FlowError::Eos)
    );

    agg.stop();
}

#[test]
fn backpressure_and_flush() {
    let (agg, pads, aggregated, output) = setup(Settings::default(), Options::default(), 2);
    agg.start().unwrap();

    for pad in &pads {
        start_stream(pad);
    }

    pads[0].chain(buffer(b"0", Duration::ZERO)).unwrap();

    let (sender, receiver) = mpsc::channel();
    let pad = pads[0].clone();
    let handle = thread::spawn(move || {
        sender.send(pad.chain(buffer(b"1", 100 * MS))).unwrap();
    });

    // No space without latency
    assert!(receiver.recv_timeout(200 * MS).is_err());

    assert!(pads[0].send_event(Event::flush_start()));
    assert_eq!(
        receiver.recv_timeout(TIMEOUT).unwrap(),
        Err(FlowError::Flushing)
    );
    handle.join().unwrap();

    // Only one input is flushing, nothing goes downstream
    assert_eq!(agg.state(), AggregatorState::FlushPending);
    assert!(output.try_recv().is_err());

    assert!(pads[0].send_event(Event::flush_stop(true)));
    assert_eq!(agg.state(), AggregatorState::Running);

    start_stream(&pads[0]);
    pads[0].chain(buffer(b"2", 200 * MS)).unwrap();
    pads[1].chain(buffer(b"3", 200 * MS)).unwrap();

    let res = aggregated.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(res.peeked[0].as_ref().unwrap().data(), b"2");
    assert_eq!(res.peeked[1].as_ref().unwrap().data(), b"3");

    agg.stop();
}

#[test]
fn flush_round_across_inputs() {
    let (agg, pads, aggregated, output) = setup(Settings::default(), Options::default(), 2);
    agg.start().unwrap();

    for pad in &pads {
        start_stream(pad);
        pad.chain(buffer(b"a", Duration::ZERO)).unwrap();
    }
    aggregated.recv_timeout(TIMEOUT).unwrap();
    expect_event(&output, EventType::StreamStart);
    expect_event(&output, EventType::Caps);
    expect_event(&output, EventType::Segment);
    expect_buffer(&output);

    let flush_start = Event::flush_start();
    let seqnum = flush_start.seqnum();

    assert!(pads[0].send_event(flush_start.clone()));
    assert!(output.recv_timeout(100 * MS).is_err());
    assert!(pads[1].send_event(flush_start));
    assert_eq!(
        expect_event(&output, EventType::FlushStart).seqnum(),
        seqnum
    );
    assert_eq!(agg.state(), AggregatorState::FlushPending);

    let flush_stop = Event::flush_stop(true).with_seqnum(seqnum);
    assert!(pads[0].send_event(flush_stop.clone()));
    assert!(output.recv_timeout(100 * MS).is_err());
    assert!(pads[1].send_event(flush_stop));
    assert_eq!(expect_event(&output, EventType::FlushStop).seqnum(), seqnum);
    assert_eq!(agg.state(), AggregatorState::Running);

    // Data flows again, starting with a new segment
    for pad in &pads {
        assert!(pad.send_event(Event::segment(Segment::new())));
        pad.chain(buffer(b"b", Duration::ZERO)).unwrap();
    }
    aggregated.recv_timeout(TIMEOUT).unwrap();
    expect_event(&output, EventType::Segment);
    assert_eq!(expect_buffer(&output).data(), b"bb");

    agg.stop();
}

#[test]
fn flush_round_one_input_after_the_other() {
    let (agg, pads, _aggregated, output) = setup(Settings::default(), Options::default(), 2);
    agg.start().unwrap();

    for pad in &pads {
        start_stream(pad);
    }

    let flush_start = Event::flush_start();
    let seqnum = flush_start.seqnum();
    let flush_stop = Event::flush_stop(true).with_seqnum(seqnum);

    // The first input finishes its flush before the second one starts
    assert!(pads[0].send_event(flush_start.clone()));
    assert!(pads[0].send_event(flush_stop.clone()));
    assert!(output.recv_timeout(100 * MS).is_err());

    assert!(pads[1].send_event(flush_start));
    assert_eq!(
        expect_event(&output, EventType::FlushStart).seqnum(),
        seqnum
    );
    assert_eq!(agg.state(), AggregatorState::FlushPending);

    assert!(pads[1].send_event(flush_stop));
    assert_eq!(expect_event(&output, EventType::FlushStop).seqnum(), seqnum);
    assert!(output.recv_timeout(100 * MS).is_err());
    assert_eq!(agg.state(), AggregatorState::Running);

    agg.stop();
}

#[test]
fn partial_flush_keeps_sticky_events() {
    let (agg, pads, aggregated, output) = setup(Settings::default(), Options::default(), 2);
    agg.start().unwrap();

    for pad in &pads {
        start_stream(pad);
    }

    // Queued behind the buffer, the other input has no data yet
    pads[0].chain(buffer(b"a", Duration::ZERO)).unwrap();
    assert!(pads[0].send_event(Event::custom(EventType::CustomDownstreamSticky, "kept")));
    assert!(pads[0].send_event(Event::custom(EventType::CustomDownstream, "dropped")));
    assert!(pads[0].send_event(Event::segment(Segment::new())));
    assert!(output.recv_timeout(100 * MS).is_err());

    let flush_start = Event::flush_start();
    let seqnum = flush_start.seqnum();
    assert!(pads[0].send_event(flush_start));
    assert!(pads[0].send_event(Event::flush_stop(true).with_seqnum(seqnum)));
    assert!(output.recv_timeout(100 * MS).is_err());

    assert!(pads[0].send_event(Event::segment(Segment::new())));
    let kept = expect_event(&output, EventType::CustomDownstreamSticky);
    assert_eq!(
        kept.view(),
        &EventView::Custom {
            type_: EventType::CustomDownstreamSticky,
            name: "kept".into(),
        }
    );
    assert!(output.recv_timeout(200 * MS).is_err());

    // The buffer went with the flush
    pads[0].chain(buffer(b"b", 100 * MS)).unwrap();
    pads[1].chain(buffer(b"c", 100 * MS)).unwrap();
    let res = aggregated.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(res.peeked[0].as_ref().unwrap().data(), b"b");

    agg.stop();
}

#[test]
fn serialized_query_waits_for_data() {
    let (agg, pads, aggregated, _output) = setup(Settings::default(), Options::default(), 2);
    agg.start().unwrap();

    for pad in &pads {
        start_stream(pad);
    }
    pads[0].chain(buffer(b"a", Duration::ZERO)).unwrap();

    let (sender, receiver) = mpsc::channel();
    let pad = pads[0].clone();
    let handle = thread::spawn(move || {
        let mut query = Query::new_custom("test-query", true);
        let res = pad.query(&mut query);
        sender.send((res, query)).unwrap();
    });

    // Queued behind the buffer
    assert!(receiver.recv_timeout(200 * MS).is_err());

    pads[1].chain(buffer(b"b", Duration::ZERO)).unwrap();
    aggregated.recv_timeout(TIMEOUT).unwrap();

    let (res, query) = receiver.recv_timeout(TIMEOUT).unwrap();
    assert!(res);
    assert_eq!(
        query,
        Query::Custom {
            name: "test-query".into(),
            serialized: true,
            result: Some("answered".into()),
        }
    );
    handle.join().unwrap();

    agg.stop();
}

#[test]
fn serialized_query_unblocked_by_flush() {
    let (agg, pads, _aggregated, _output) = setup(Settings::default(), Options::default(), 2);
    agg.start().unwrap();

    start_stream(&pads[0]);
    pads[0].chain(buffer(b"a", Duration::ZERO)).unwrap();

    let (sender, receiver) = mpsc::channel();
    let pad = pads[0].clone();
    let handle = thread::spawn(move || {
        sender.send(pad.query(&mut Query::Drain)).unwrap();
    });
    assert!(receiver.recv_timeout(200 * MS).is_err());

    assert!(pads[0].send_event(Event::flush_start()));
    assert!(!receiver.recv_timeout(TIMEOUT).unwrap());
    handle.join().unwrap();

    agg.stop();
}

#[test]
fn gap_becomes_buffer() {
    let (agg, pads, aggregated, output) = setup(Settings::default(), Options::default(), 1);
    agg.start().unwrap();

    start_stream(&pads[0]);
    assert!(pads[0].send_event(Event::gap(Duration::from_secs(1), 500 * MS)));

    let res = aggregated.recv_timeout(TIMEOUT).unwrap();
    assert!(res.peeked[0].is_some());

    expect_event(&output, EventType::StreamStart);
    expect_event(&output, EventType::Caps);
    expect_event(&output, EventType::Segment);
    let gap = expect_buffer(&output);
    assert_eq!(gap.pts(), Some(Duration::from_secs(1)));
    assert_eq!(gap.duration(), Some(500 * MS));
    assert_eq!(gap.flags(), BufferFlags::GAP | BufferFlags::DROPPABLE);
    assert_eq!(gap.size(), 0);

    assert!(pads[0].send_event(Event::gap_missing_data(Duration::from_secs(2), None)));
    aggregated.recv_timeout(TIMEOUT).unwrap();
    let gap = expect_buffer(&output);
    assert_eq!(gap.pts(), Some(Duration::from_secs(2)));
    assert!(gap.flags().contains(BufferFlags::MISSING_DATA | BufferFlags::GAP));

    agg.stop();
}

#[test]
fn latency_query() {
    let settings = Settings {
        latency: 50 * MS,
        ..Default::default()
    };
    let (agg, pads, _aggregated, _output) = setup(settings, Options::default(), 2);

    pads[0].set_upstream(Arc::new(LiveUpstream {
        min: 100 * MS,
        max: Some(Duration::from_secs(1)),
    }));
    pads[1].set_upstream(Arc::new(LiveUpstream {
        min: 200 * MS,
        max: Some(500 * MS),
    }));
    agg.set_latency(10 * MS, Some(20 * MS)).unwrap();

    let mut query = Query::new_latency();
    assert!(agg.query(&mut query));
    let Query::Latency(latency) = query else {
        unreachable!();
    };
    assert!(latency.live);
    assert_eq!(latency.min, 260 * MS);
    assert_eq!(latency.max, Some(570 * MS));

    assert!(agg.is_live());
    assert_eq!(agg.latency(), Some(260 * MS));

    // The floor applies to both bounds
    agg.set_min_upstream_latency(300 * MS);
    let mut query = Query::new_latency();
    assert!(agg.query(&mut query));
    assert_eq!(
        query,
        Query::Latency(LatencyQuery {
            live: true,
            min: 360 * MS,
            max: Some(670 * MS),
        })
    );
}

#[test]
fn latency_query_without_sub_latency() {
    let settings = Settings {
        latency: 50 * MS,
        ..Default::default()
    };
    let (agg, pads, _aggregated, _output) = setup(settings, Options::default(), 1);

    pads[0].set_upstream(Arc::new(LiveUpstream {
        min: 100 * MS,
        max: Some(Duration::from_secs(1)),
    }));

    let mut query = Query::new_latency();
    assert!(agg.query(&mut query));
    assert_eq!(
        query,
        Query::Latency(LatencyQuery {
            live: true,
            min: 150 * MS,
            max: Some(1050 * MS),
        })
    );
}

#[test]
fn latency_property() {
    let settings = Settings {
        latency: 50 * MS,
        ..Default::default()
    };
    let options = Options {
        live_position: Some(Duration::ZERO),
        ..Default::default()
    };
    let (agg, pads, _aggregated, _output) = setup(settings, options, 2);

    pads[0].set_upstream(Arc::new(LiveUpstream {
        min: 100 * MS,
        max: Some(Duration::from_secs(1)),
    }));

    let clock = TestClock::new();
    agg.set_clock(Some(Arc::new(clock.clone())));
    agg.start().unwrap();

    // Upstream minimum plus our latency
    wait_for_clock_wait(&clock, 150 * MS);

    // The pending wait is replaced by one with the new deadline
    agg.set_latency_property(200 * MS);
    assert_eq!(agg.settings().latency, 200 * MS);
    wait_for_clock_wait(&clock, 300 * MS);

    // Limited to what fits below the upstream maximum
    agg.set_latency_property(Duration::from_secs(2));
    assert_eq!(agg.settings().latency, 900 * MS);
    wait_for_clock_wait(&clock, Duration::from_secs(1));

    agg.stop();
    assert_eq!(clock.pending_id_count(), 0);
}

#[test]
fn impossible_latency() {
    let (agg, pads, _aggregated, _output) = setup(Settings::default(), Options::default(), 2);

    pads[0].set_upstream(Arc::new(LiveUpstream {
        min: 300 * MS,
        max: Some(400 * MS),
    }));
    pads[1].set_upstream(Arc::new(LiveUpstream {
        min: 100 * MS,
        max: Some(200 * MS),
    }));

    let mut query = Query::new_latency();
    assert!(!agg.query(&mut query));
    assert_eq!(agg.latency(), None);

    assert!(matches!(
        agg.set_latency(20 * MS, Some(10 * MS)),
        Err(Error::InvalidLatency { .. })
    ));
}

#[test]
fn seeking_query() {
    let (agg, _pads, _aggregated, _output) = setup(Settings::default(), Options::default(), 1);

    let mut query = Query::Seeking { seekable: true };
    assert!(agg.query(&mut query));
    assert_eq!(query, Query::Seeking { seekable: false });
}

#[test]
fn live_timeout() {
    let settings = Settings {
        latency: 50 * MS,
        force_live: true,
        ..Default::default()
    };
    let options = Options {
        live_position: Some(Duration::ZERO),
        ..Default::default()
    };
    let (agg, pads, aggregated, output) = setup(settings, options, 2);

    let clock = TestClock::new();
    agg.set_clock(Some(Arc::new(clock.clone())));
    agg.start().unwrap();

    for pad in &pads {
        start_stream(pad);
    }
    pads[0].chain(buffer(b"a", Duration::ZERO)).unwrap();

    // Deadline of the first output: base time + position + latency
    assert_eq!(clock.wait_for_pending_id(), 50 * MS);
    assert!(aggregated.try_recv().is_err());

    clock.set_time(50 * MS);
    let res = aggregated.recv_timeout(TIMEOUT).unwrap();
    assert!(res.timeout);
    assert_eq!(res.peeked[0].as_ref().unwrap().data(), b"a");
    assert!(res.peeked[1].is_none());

    expect_event(&output, EventType::StreamStart);
    expect_event(&output, EventType::Caps);
    expect_event(&output, EventType::Segment);
    assert_eq!(expect_buffer(&output).data(), b"a");

    // The next output is due 100ms later
    assert_eq!(clock.wait_for_pending_id(), 150 * MS);

    // Stopping cancels the pending wait
    agg.stop();
    assert_eq!(clock.pending_id_count(), 0);
}

#[test]
fn live_skips_stale_buffers() {
    let (sender, skipped) = mpsc::channel();
    let settings = Settings {
        force_live: true,
        ..Default::default()
    };
    let options = Options {
        skip_before: Some((100 * MS, sender)),
        ..Default::default()
    };
    let (agg, pads, aggregated, _output) = setup(settings, options, 2);
    agg.start().unwrap();

    for pad in &pads {
        start_stream(pad);
    }

    // Two buffers fit into a live input
    pads[0].chain(buffer(b"old", Duration::ZERO)).unwrap();
    pads[0].chain(buffer(b"new", 200 * MS)).unwrap();
    assert_eq!(skipped.recv_timeout(TIMEOUT).unwrap().data(), b"old");

    pads[1].chain(buffer(b"b", 200 * MS)).unwrap();
    let res = aggregated.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(res.peeked[0].as_ref().unwrap().data(), b"new");
    assert_eq!(res.peeked[1].as_ref().unwrap().data(), b"b");
    assert!(skipped.try_recv().is_err());

    agg.stop();
}

#[test]
fn ignore_inactive_pads() {
    let settings = Settings {
        latency: 50 * MS,
        force_live: true,
        ignore_inactive_pads: true,
        ..Default::default()
    };
    let options = Options {
        live_position: Some(Duration::ZERO),
        ..Default::default()
    };
    let (agg, pads, aggregated, _output) = setup(settings, options, 2);

    let clock = TestClock::new();
    agg.set_clock(Some(Arc::new(clock.clone())));
    agg.start().unwrap();

    for pad in &pads {
        start_stream(pad);
    }
    pads[0].chain(buffer(b"a", Duration::ZERO)).unwrap();
    assert!(!pads[0].is_inactive());
    assert!(pads[1].is_inactive());

    // Waited once for the silent input
    assert_eq!(clock.wait_for_pending_id(), 50 * MS);
    clock.set_time(50 * MS);
    let res = aggregated.recv_timeout(TIMEOUT).unwrap();
    assert!(res.timeout);
    assert!(res.peeked[1].is_none());

    // From now on it is not waited for anymore
    wait_for_clock_wait(&clock, 150 * MS);
    pads[0].chain(buffer(b"b", 100 * MS)).unwrap();
    let res = aggregated.recv_timeout(TIMEOUT).unwrap();
    assert!(!res.timeout);
    assert_eq!(res.peeked[0].as_ref().unwrap().data(), b"b");
    assert!(res.peeked[1].is_none());
    assert_eq!(clock.time(), 50 * MS);

    // Data makes it active again
    pads[1].chain(buffer(b"c", 200 * MS)).unwrap();
    assert!(!pads[1].is_inactive());

    agg.stop();
}

#[test]
fn start_time_first_live() {
    let settings = Settings {
        latency: 50 * MS,
        force_live: true,
        start_time_selection: StartTimeSelection::First,
        ..Default::default()
    };
    let options = Options {
        segment_next_time: true,
        ..Default::default()
    };
    let (agg, pads, _aggregated, _output) = setup(settings, options, 2);

    let clock = TestClock::new();
    agg.set_clock(Some(Arc::new(clock.clone())));
    agg.start().unwrap();

    for pad in &pads {
        start_stream(pad);
    }

    // No deadline before the start time is known
    assert_eq!(clock.wait_for_pending_id_timeout(200 * MS), None);

    pads[0].chain(buffer(b"a", Duration::from_secs(1))).unwrap();
    assert_eq!(agg.segment().position(), Some(Duration::from_secs(1)));
    wait_for_clock_wait(&clock, 1050 * MS);

    agg.stop();
}

#[test]
fn start_time_set() {
    let settings = Settings {
        start_time_selection: StartTimeSelection::Set,
        start_time: Some(500 * MS),
        ..Default::default()
    };
    let (agg, pads, _aggregated, output) = setup(settings, Options::default(), 1);
    agg.start().unwrap();

    start_stream(&pads[0]);
    pads[0].chain(buffer(b"a", Duration::from_secs(2))).unwrap();

    expect_event(&output, EventType::StreamStart);
    expect_event(&output, EventType::Caps);
    let segment = expect_event(&output, EventType::Segment);
    let EventView::Segment(segment) = segment.view() else {
        unreachable!();
    };
    assert_eq!(segment.position(), Some(500 * MS));
    assert_eq!(expect_buffer(&output).data(), b"a");

    agg.stop();
}

#[test]
fn flushing_seek_without_upstream() {
    let (agg, _pads, _aggregated, output) = setup(Settings::default(), Options::default(), 2);
    agg.start().unwrap();

    let seek = Event::seek(1.0, true, Duration::from_secs(1), None);
    let seqnum = seek.seqnum();
    assert!(agg.send_event(seek.clone()));

    // Nobody handled it, the flush is finished right away
    assert_eq!(expect_event(&output, EventType::FlushStart).seqnum(), seqnum);
    assert_eq!(expect_event(&output, EventType::FlushStop).seqnum(), seqnum);
    assert_eq!(agg.state(), AggregatorState::Running);
    assert_eq!(agg.segment().start(), Duration::from_secs(1));

    // Same seek again
    assert!(agg.send_event(seek));
    assert!(output.recv_timeout(200 * MS).is_err());

    agg.stop();
}

#[test]
fn flushing_seek_forwarded_upstream() {
    let (agg, pads, _aggregated, output) = setup(Settings::default(), Options::default(), 2);

    let (sender, upstream_events) = mpsc::channel();
    for pad in &pads {
        pad.set_upstream(Arc::new(SeekHandler {
            sender: Mutex::new(sender.clone()),
        }));
    }
    agg.start().unwrap();

    let seek = Event::seek(1.0, true, None, None);
    let seqnum = seek.seqnum();
    assert!(agg.send_event(seek));

    assert_eq!(expect_event(&output, EventType::FlushStart).seqnum(), seqnum);
    for _ in &pads {
        let event = upstream_events.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(event.type_(), EventType::Seek);
        assert_eq!(event.seqnum(), seqnum);
    }
    assert_eq!(agg.state(), AggregatorState::FlushPending);

    // Upstream flushes every input with the seek's seqnum
    for pad in &pads {
        assert!(pad.send_event(Event::flush_start().with_seqnum(seqnum)));
    }
    assert!(output.recv_timeout(100 * MS).is_err());

    for pad in &pads {
        assert!(pad.send_event(Event::flush_stop(true).with_seqnum(seqnum)));
    }
    assert_eq!(expect_event(&output, EventType::FlushStop).seqnum(), seqnum);
    assert_eq!(agg.state(), AggregatorState::Running);

    agg.stop();
}

#[test]
fn seek_with_zero_rate() {
    let (agg, _pads, _aggregated, output) = setup(Settings::default(), Options::default(), 1);
    agg.start().unwrap();

    assert!(!agg.send_event(Event::seek(0.0, true, None, None)));
    assert!(output.recv_timeout(100 * MS).is_err());
    assert_eq!(agg.state(), AggregatorState::Running);

    agg.stop();
}

#[test]
fn tags_after_segment() {
    let (agg, pads, _aggregated, output) = setup(Settings::default(), Options::default(), 1);
    agg.start().unwrap();

    let mut tags = TagList::new();
    tags.add("title", "first");
    agg.merge_tags(&tags);

    start_stream(&pads[0]);
    pads[0].chain(buffer(b"a", Duration::ZERO)).unwrap();

    expect_event(&output, EventType::StreamStart);
    expect_event(&output, EventType::Caps);
    expect_event(&output, EventType::Segment);
    let event = expect_event(&output, EventType::Tag);
    let EventView::Tag(tags) = event.view() else {
        unreachable!();
    };
    assert_eq!(tags.get("title"), Some("first"));
    assert_eq!(expect_buffer(&output).data(), b"a");

    // Only sent again after a change, merged with the earlier tags
    pads[0].chain(buffer(b"b", 100 * MS)).unwrap();
    assert_eq!(expect_buffer(&output).data(), b"b");

    let mut tags = TagList::new();
    tags.add("artist", "someone");
    agg.merge_tags(&tags);
    pads[0].chain(buffer(b"c", 200 * MS)).unwrap();

    let event = expect_event(&output, EventType::Tag);
    let EventView::Tag(tags) = event.view() else {
        unreachable!();
    };
    assert_eq!(tags.get("title"), Some("first"));
    assert_eq!(tags.get("artist"), Some("someone"));
    assert_eq!(expect_buffer(&output).data(), b"c");

    agg.stop();
}

#[test]
fn application_eos() {
    let (agg, _pads, _aggregated, output) = setup(Settings::default(), Options::default(), 1);
    agg.start().unwrap();

    assert!(agg.send_event(Event::eos()));

    expect_event(&output, EventType::StreamStart);
    expect_event(&output, EventType::Segment);
    expect_event(&output, EventType::Eos);

    wait_for_state(&agg, AggregatorState::Started);
    agg.stop();
}

#[test]
fn restart_after_eos() {
    let (agg, pads, _aggregated, output) = setup(Settings::default(), Options::default(), 1);
    agg.start().unwrap();
    let pad = &pads[0];

    start_stream(pad);
    pad.chain(buffer(b"first", Duration::ZERO)).unwrap();
    assert!(pad.send_event(Event::eos()));

    let first_stream = expect_event(&output, EventType::StreamStart);
    expect_event(&output, EventType::Caps);
    expect_event(&output, EventType::Segment);
    assert_eq!(expect_buffer(&output).data(), b"first");
    expect_event(&output, EventType::Eos);

    wait_for_state(&agg, AggregatorState::Started);
    assert_eq!(
        pad.chain(buffer(b"dropped", Duration::ZERO)),
        Err(FlowError::Eos)
    );

    start_stream(pad);
    pad.chain(buffer(b"second", Duration::ZERO)).unwrap();
    assert!(pad.send_event(Event::eos()));

    let second_stream = expect_event(&output, EventType::StreamStart);
    assert_ne!(first_stream.view(), second_stream.view());
    expect_event(&output, EventType::Segment);
    assert_eq!(expect_buffer(&output).data(), b"second");
    expect_event(&output, EventType::Eos);

    agg.stop();
}

#[test]
fn rejected_caps() {
    let options = Options {
        reject_caps: true,
        ..Default::default()
    };
    let (agg, pads, aggregated, _output) = setup(Settings::default(), options, 1);
    agg.start().unwrap();

    start_stream(&pads[0]);
    assert!(pads[0].send_event(Event::caps(Caps::new("test/unsupported"))));

    let res = pads[0]
        .chain(buffer(b"a", Duration::ZERO))
        .and_then(|_| pads[0].chain(buffer(b"b", 100 * MS)));
    assert_eq!(res, Err(FlowError::NotNegotiated));
    assert!(aggregated.try_recv().is_err());

    wait_for_state(&agg, AggregatorState::Started);
    agg.stop();
}

#[test]
fn pad_names() {
    let (agg, pads, _aggregated, _output) = setup(Settings::default(), Options::default(), 2);

    assert_eq!(pads[0].name(), "sink_0");
    assert_eq!(pads[1].name(), "sink_1");

    let pad = agg.request_pad(Some("sink_5")).unwrap();
    assert_eq!(pad.name(), "sink_5");
    assert!(agg.request_pad(Some("sink_5")).is_none());
    assert_eq!(agg.request_pad(None).unwrap().name(), "sink_6");
    assert_eq!(agg.pads().len(), 4);

    agg.release_pad(&pad);
    assert_eq!(agg.pads().len(), 3);
    assert!(!agg.pads().contains(&pad));
    assert_eq!(pad.chain(buffer(b"a", Duration::ZERO)), Err(FlowError::Flushing));
}

#[test]
fn start_twice() {
    let (agg, _pads, _aggregated, _output) = setup(Settings::default(), Options::default(), 1);
    assert_eq!(agg.state(), AggregatorState::Stopped);

    agg.start().unwrap();
    assert!(matches!(agg.start(), Err(Error::AlreadyStarted)));

    agg.stop();
    assert_eq!(agg.state(), AggregatorState::Stopped);

    agg.start().unwrap();
    assert_eq!(agg.state(), AggregatorState::Running);
    agg.stop();
}
