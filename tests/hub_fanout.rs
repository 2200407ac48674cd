use anyhow::Result;
use bytes::Bytes;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::io::Write;
use std::time::{Duration, Instant};

use live_recorder::{ConsumerKind, DistributionHub, HubSettings, StreamStatus};

struct ChannelSink(Sender<Vec<u8>>);

impl Write for ChannelSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .send(buf.to_vec())
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Blocks every write until the gate yields a token or is dropped.
struct GatedSink {
    gate: Receiver<()>,
    out: Sender<Vec<u8>>,
}

impl Write for GatedSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let _ = self.gate.recv();
        let _ = self.out.send(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct BrokenSink;

impl Write for BrokenSink {
    fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
        Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn slow_consumer_drops_without_delaying_fast_consumer() -> Result<()> {
    let hub = DistributionHub::new(HubSettings {
        stream_capacity: 100,
        consumer_capacity: 1,
    });
    let stream = hub.get_or_create_stream("cam")?;

    let (fast_tx, fast_rx) = unbounded();
    stream.attach("fast", ConsumerKind::Raw, Box::new(ChannelSink(fast_tx)))?;
    let (gate_tx, gate_rx) = bounded::<()>(0);
    let (slow_tx, slow_rx) = unbounded();
    stream.attach(
        "slow",
        ConsumerKind::HttpFlv,
        Box::new(GatedSink {
            gate: gate_rx,
            out: slow_tx,
        }),
    )?;

    for i in 0..10u8 {
        assert!(stream.publish(Bytes::from(vec![i, i])));
        let got = fast_rx.recv_timeout(Duration::from_secs(2))?;
        assert_eq!(got, vec![i, i]);
    }

    assert!(wait_until(Duration::from_secs(2), || {
        stream
            .consumer_status("fast")
            .is_some_and(|status| status.delivered == 10)
    }));
    let fast = stream.consumer_status("fast").expect("fast attached");
    assert_eq!(fast.dropped, 0);
    let slow = stream.consumer_status("slow").expect("slow attached");
    assert!(slow.dropped >= 8, "slow consumer dropped {}", slow.dropped);

    drop(gate_tx);
    let mut slow_got = Vec::new();
    while let Ok(packet) = slow_rx.recv_timeout(Duration::from_millis(300)) {
        slow_got.push(packet[0]);
    }
    assert_eq!(slow_got.len() as u64 + slow.dropped, 10);
    assert!(slow_got.windows(2).all(|pair| pair[0] < pair[1]));

    hub.shutdown();
    Ok(())
}

#[test]
fn failed_write_detaches_only_that_consumer() -> Result<()> {
    let hub = DistributionHub::new(HubSettings::default());
    let stream = hub.get_or_create_stream("cam")?;
    let broken = stream.attach("broken", ConsumerKind::Rtsp, Box::new(BrokenSink))?;
    let (tx, rx) = unbounded();
    stream.attach("ok", ConsumerKind::Raw, Box::new(ChannelSink(tx)))?;

    stream.publish(Bytes::from_static(b"frame"));

    assert!(wait_until(Duration::from_secs(2), || !broken.is_attached()));
    assert_eq!(rx.recv_timeout(Duration::from_secs(2))?, b"frame");
    assert_eq!(stream.consumer_count(), 1);
    assert!(stream.consumer_status("ok").is_some());
    hub.shutdown();
    Ok(())
}

#[test]
fn removing_a_stream_cancels_its_consumers() -> Result<()> {
    let hub = DistributionHub::new(HubSettings::default());
    let stream = hub.get_or_create_stream("cam")?;
    let (tx, _rx) = unbounded();
    let attachment = stream.attach("viewer", ConsumerKind::Raw, Box::new(ChannelSink(tx)))?;
    assert!(attachment.is_attached());

    assert!(hub.remove_stream("cam"));
    assert!(!attachment.is_attached());
    assert!(!stream.is_active());
    assert!(!stream.publish(Bytes::from_static(b"late")));
    assert!(stream
        .attach("again", ConsumerKind::Raw, Box::new(BrokenSink))
        .is_err());
    assert!(hub.status().is_empty());
    assert!(!hub.remove_stream("cam"));
    Ok(())
}

#[test]
fn status_reports_consumers_per_stream() -> Result<()> {
    let hub = DistributionHub::new(HubSettings::default());
    let gate = hub.get_or_create_stream("gate")?;
    hub.get_or_create_stream("yard")?;
    let (tx, _rx) = unbounded();
    gate.attach("viewer", ConsumerKind::Raw, Box::new(ChannelSink(tx)))?;

    let status = hub.status();
    let gate_status: &StreamStatus = status.get("gate").expect("gate listed");
    assert_eq!(gate_status.consumer_count, 1);
    assert!(gate_status.active);
    assert_eq!(gate_status.consumers.len(), 1);
    assert_eq!(gate_status.consumers[0].id, "viewer");
    assert_eq!(status.get("yard").map(|s| s.consumer_count), Some(0));

    let json = serde_json::to_value(&status)?;
    assert_eq!(json["gate"]["consumerCount"], 1);
    assert_eq!(json["gate"]["active"], true);
    assert_eq!(json["gate"]["published"], 0);
    assert_eq!(json["gate"]["dropped"], 0);
    assert_eq!(json["gate"]["consumers"][0]["id"], "viewer");
    assert_eq!(json["yard"]["consumerCount"], 0);
    assert!(json["yard"].get("consumer_count").is_none());

    assert!(std::sync::Arc::ptr_eq(&gate, &hub.get_or_create_stream("gate")?));
    hub.shutdown();
    assert!(hub.status().is_empty());
    Ok(())
}

#[test]
fn attaching_same_id_replaces_previous_consumer() -> Result<()> {
    let hub = DistributionHub::new(HubSettings::default());
    let stream = hub.get_or_create_stream("cam")?;
    let (old_tx, old_rx) = unbounded();
    let (new_tx, new_rx) = unbounded();
    stream.attach("viewer", ConsumerKind::Raw, Box::new(ChannelSink(old_tx)))?;
    stream.attach("viewer", ConsumerKind::Raw, Box::new(ChannelSink(new_tx)))?;
    assert_eq!(stream.consumer_count(), 1);

    stream.publish(Bytes::from_static(b"frame"));
    assert_eq!(new_rx.recv_timeout(Duration::from_secs(2))?, b"frame");
    assert!(old_rx.recv_timeout(Duration::from_millis(100)).is_err());
    hub.shutdown();
    Ok(())
}

#[test]
fn publish_creates_stream_on_first_use() -> Result<()> {
    let hub = DistributionHub::new(HubSettings::default());
    assert!(hub.get_stream("cam").is_none());
    assert!(hub.publish("cam", Bytes::from_static(b"xx"))?);
    let stream = hub.get_stream("cam").expect("created");
    assert_eq!(stream.published(), 1);
    assert_eq!(stream.id(), "cam");
    hub.shutdown();
    Ok(())
}

#[test]
fn shut_down_hub_refuses_new_streams() -> Result<()> {
    let hub = DistributionHub::new(HubSettings::default());
    hub.get_or_create_stream("cam")?;
    hub.shutdown();
    assert!(hub.get_or_create_stream("cam").is_err());
    assert!(hub.publish("cam", Bytes::from_static(b"xx")).is_err());
    assert!(hub.get_stream("cam").is_none());
    Ok(())
}
