//! Multi-threaded streamer: a bounded pool of lazily allocated buffers moves
//! bytes between the calling thread and one background worker thread.
//!
//! In a plain stream the worker runs the source side and the caller runs the
//! sink side. In a forked stream the roles flip: the caller reads the source
//! and feeds two queues, and the worker runs the primary-sink drain followed
//! by the secondary-sink drain.

use std::sync::Mutex;
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};

use crate::stream::{
    fill_buffer, ForkedStream, SecondaryStreamDecision, StreamSink, StreamSource, Streamer,
};
use crate::worker::Worker;
use crate::{Result, StreamError};

/// Buffer-pool geometry for [`MultiThreadedStreamer`].
#[derive(Debug, Clone, Copy)]
pub struct MultiThreadedStreamerOptions {
    /// Ceiling on the number of buffers allocated per queue.
    pub num_buffers: usize,
    pub bytes_per_buffer: usize,
}

impl Default for MultiThreadedStreamerOptions {
    fn default() -> Self {
        Self { num_buffers: 4, bytes_per_buffer: 1 << 20 }
    }
}

/// Streams with a producer thread and a consumer thread connected by FIFO
/// buffer queues, preserving byte order at every sink.
pub struct MultiThreadedStreamer {
    options: MultiThreadedStreamerOptions,
}

impl MultiThreadedStreamer {
    pub fn new(options: MultiThreadedStreamerOptions) -> Self {
        assert!(options.num_buffers > 0);
        assert!(options.bytes_per_buffer > 0);
        Self { options }
    }
}

struct Buffer {
    data: Box<[u8]>,
    len: usize,
}

impl Buffer {
    fn new(capacity: usize) -> Self {
        Self { data: vec![0u8; capacity].into_boxed_slice(), len: 0 }
    }

    fn bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

enum Packet {
    Data { buf: Buffer, end: bool },
    /// Synthetic end marker carrying no payload; used to cancel a sink drain
    /// and to terminate a drain after a fault on the producing side.
    End,
    Fault(StreamError),
}

/// The producing side of one buffer queue: recycled buffers come back on
/// `unused`, and new buffers are allocated lazily up to `max_buffers`.
struct Pool {
    unused: Receiver<Buffer>,
    allocated: usize,
    max_buffers: usize,
    bytes_per_buffer: usize,
}

impl Pool {
    fn new(unused: Receiver<Buffer>, options: MultiThreadedStreamerOptions) -> Self {
        Self {
            unused,
            allocated: 0,
            max_buffers: options.num_buffers,
            bytes_per_buffer: options.bytes_per_buffer,
        }
    }

    fn allocate(&mut self) -> Buffer {
        self.allocated += 1;
        Buffer::new(self.bytes_per_buffer)
    }

    /// Free buffer, new allocation, or block until one is recycled. `None`
    /// means the consuming side is gone.
    fn acquire_blocking(&mut self) -> Option<Buffer> {
        match self.unused.try_recv() {
            Ok(buf) => Some(buf),
            Err(TryRecvError::Empty) if self.allocated < self.max_buffers => {
                Some(self.allocate())
            }
            Err(TryRecvError::Empty) => self.unused.recv().ok(),
            Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Like `acquire_blocking`, but gives up instead of blocking.
    fn acquire_nonblocking(&mut self) -> Option<Buffer> {
        match self.unused.try_recv() {
            Ok(buf) => Some(buf),
            Err(TryRecvError::Empty) if self.allocated < self.max_buffers => {
                Some(self.allocate())
            }
            Err(_) => None,
        }
    }
}

/// Feed packets from `filled` into `sink` until an end marker arrives,
/// recycling buffers as they drain. A sink fault does not stop consumption
/// (the producing side must not block on a full queue); it is returned once
/// the drain completes.
fn drain_into(
    filled: &Receiver<Packet>,
    recycle: &Sender<Buffer>,
    sink: &mut dyn StreamSink,
    progress: &mut dyn FnMut(usize),
) -> Result<()> {
    let mut fault = None;
    loop {
        match filled.recv() {
            Ok(Packet::Data { buf, end }) => {
                if fault.is_none() {
                    match sink.write(buf.bytes()) {
                        Ok(()) => progress(buf.len),
                        Err(e) => fault = Some(e),
                    }
                }
                let _ = recycle.send(buf);
                if end {
                    break;
                }
            }
            Ok(Packet::End) => break,
            Ok(Packet::Fault(e)) => {
                fault = Some(e);
                break;
            }
            Err(_) => break,
        }
    }
    match fault {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// The forked stream's cross-thread callbacks, serialized behind one lock.
struct Callbacks<'a> {
    primary_done: &'a mut (dyn FnMut() -> SecondaryStreamDecision + Send),
    primary_progress: &'a mut (dyn FnMut(usize) + Send),
    secondary_progress: &'a mut (dyn FnMut(usize) + Send),
}

/// Secondary-feed state while the caller is reading the source.
enum Feed {
    Running,
    /// Feeding was abandoned at this stream position because no secondary
    /// buffer was available.
    Starved { pos: u64 },
}

impl Streamer for MultiThreadedStreamer {
    fn stream_with_progress(
        &self,
        source: &mut dyn StreamSource,
        sink: &mut dyn StreamSink,
        progress: &mut (dyn FnMut(usize) + Send),
    ) -> Result<()> {
        let options = self.options;
        thread::scope(|scope| {
            let worker = Worker::new(scope);
            let (filled_tx, filled_rx) = bounded::<Packet>(options.num_buffers + 1);
            let (recycle_tx, recycle_rx) = bounded::<Buffer>(options.num_buffers + 1);
            let mut pool = Pool::new(recycle_rx, options);

            worker.run(move || loop {
                let Some(mut buf) = pool.acquire_blocking() else {
                    return;
                };
                let outcome = match fill_buffer(source, &mut buf.data) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        let _ = filled_tx.send(Packet::Fault(e));
                        return;
                    }
                };
                buf.len = outcome.num_bytes;
                let end = outcome.end;
                if filled_tx.send(Packet::Data { buf, end }).is_err() || end {
                    return;
                }
            });

            drain_into(&filled_rx, &recycle_tx, sink, &mut |n| progress(n))
        })
    }

    fn forked_stream(&self, fork: ForkedStream<'_>) -> Result<()> {
        let ForkedStream {
            source,
            primary_sink,
            secondary_sink,
            primary_done,
            primary_progress,
            secondary_progress,
        } = fork;
        let options = self.options;
        let callbacks = Mutex::new(Callbacks { primary_done, primary_progress, secondary_progress });
        thread::scope(|scope| {
            let worker = Worker::new(scope);
            let (p_filled_tx, p_filled_rx) = bounded::<Packet>(options.num_buffers + 1);
            let (p_recycle_tx, p_recycle_rx) = bounded::<Buffer>(options.num_buffers + 1);
            let (s_filled_tx, s_filled_rx) = bounded::<Packet>(options.num_buffers + 1);
            let (s_recycle_tx, s_recycle_rx) = bounded::<Buffer>(options.num_buffers + 1);
            let (decision_tx, decision_rx) = bounded::<Result<SecondaryStreamDecision>>(1);
            let (s_done_tx, s_done_rx) = bounded::<Result<()>>(1);

            {
                let callbacks = &callbacks;
                worker.run(move || {
                    let drained = drain_into(&p_filled_rx, &p_recycle_tx, primary_sink, &mut |n| {
                        (callbacks.lock().unwrap().primary_progress)(n)
                    });
                    let verdict = match drained {
                        Ok(()) => Ok((callbacks.lock().unwrap().primary_done)()),
                        Err(e) => Err(e),
                    };
                    let _ = decision_tx.send(verdict);
                });
            }
            {
                let callbacks = &callbacks;
                worker.run(move || {
                    let drained =
                        drain_into(&s_filled_rx, &s_recycle_tx, secondary_sink, &mut |n| {
                            (callbacks.lock().unwrap().secondary_progress)(n)
                        });
                    let _ = s_done_tx.send(drained);
                });
            }

            let mut p_pool = Pool::new(p_recycle_rx, options);
            let mut s_pool = Pool::new(s_recycle_rx, options);
            let mut feed = Feed::Running;
            let mut read_pos: u64 = 0;
            let mut source_fault = None;

            loop {
                let Some(mut pbuf) = p_pool.acquire_blocking() else {
                    break;
                };
                let outcome = match fill_buffer(source, &mut pbuf.data) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        source_fault = Some(e);
                        break;
                    }
                };
                pbuf.len = outcome.num_bytes;
                if matches!(feed, Feed::Running) && outcome.num_bytes > 0 {
                    match s_pool.acquire_nonblocking() {
                        Some(mut sbuf) => {
                            sbuf.data[..outcome.num_bytes]
                                .copy_from_slice(&pbuf.data[..outcome.num_bytes]);
                            sbuf.len = outcome.num_bytes;
                            // Never blocks: in-flight packets are bounded by
                            // the pool, which is smaller than the queue.
                            let _ = s_filled_tx.send(Packet::Data { buf: sbuf, end: false });
                        }
                        None => feed = Feed::Starved { pos: read_pos },
                    }
                }
                read_pos += outcome.num_bytes as u64;
                let end = outcome.end;
                if p_filled_tx.send(Packet::Data { buf: pbuf, end }).is_err() || end {
                    break;
                }
            }

            if let Some(e) = source_fault {
                let _ = p_filled_tx.send(Packet::End);
                let _ = s_filled_tx.send(Packet::End);
                let _ = decision_rx.recv();
                let _ = s_done_rx.recv();
                return Err(e);
            }

            let decision = match decision_rx.recv() {
                Ok(verdict) => verdict,
                Err(_) => {
                    Err(StreamError::Io(std::io::Error::other("primary drain disappeared")))
                }
            };
            match decision {
                Err(e) => {
                    let _ = s_filled_tx.send(Packet::End);
                    let _ = s_done_rx.recv();
                    Err(e)
                }
                Ok(SecondaryStreamDecision::Abandon) => {
                    let _ = s_filled_tx.send(Packet::End);
                    // The secondary is being discarded, so any fault it hit
                    // while draining is moot.
                    let _ = s_done_rx.recv();
                    Ok(())
                }
                Ok(SecondaryStreamDecision::Finish) => {
                    let replayed = match feed {
                        Feed::Running => {
                            let _ = s_filled_tx.send(Packet::End);
                            Ok(())
                        }
                        Feed::Starved { pos } => replay_tail(
                            source,
                            pos,
                            &mut s_pool,
                            &s_filled_tx,
                        ),
                    };
                    if let Err(e) = replayed {
                        let _ = s_filled_tx.send(Packet::End);
                        let _ = s_done_rx.recv();
                        return Err(e);
                    }
                    match s_done_rx.recv() {
                        Ok(drained) => drained,
                        Err(_) => Ok(()),
                    }
                }
            }
        })
    }
}

/// Seek back to the position where secondary feeding was abandoned, and feed
/// the rest of the source into the secondary queue (with backpressure; the
/// worker is draining it by now).
fn replay_tail(
    source: &mut dyn StreamSource,
    pos: u64,
    pool: &mut Pool,
    filled: &Sender<Packet>,
) -> Result<()> {
    source.seek(pos)?;
    loop {
        let Some(mut buf) = pool.acquire_blocking() else {
            return Ok(());
        };
        let outcome = fill_buffer(source, &mut buf.data)?;
        buf.len = outcome.num_bytes;
        let end = outcome.end;
        if filled.send(Packet::Data { buf, end }).is_err() || end {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::testing::{FailingSink, SliceSource, VecSink};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn small_streamer() -> MultiThreadedStreamer {
        MultiThreadedStreamer::new(MultiThreadedStreamerOptions {
            num_buffers: 3,
            bytes_per_buffer: 64,
        })
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn streams_everything_in_order() {
        let data = pattern(10_000);
        let mut source = SliceSource::new(data.clone(), 17).with_stutter();
        let mut sink = VecSink::default();
        small_streamer().stream(&mut source, &mut sink).unwrap();
        assert_eq!(sink.0, data);
    }

    #[test]
    fn empty_source_is_fine() {
        let mut source = SliceSource::new(Vec::new(), 8);
        let mut sink = VecSink::default();
        small_streamer().stream(&mut source, &mut sink).unwrap();
        assert!(sink.0.is_empty());
    }

    #[test]
    fn progress_counts_every_byte() {
        let data = pattern(5_000);
        let mut source = SliceSource::new(data, 100);
        let mut sink = VecSink::default();
        let total = AtomicUsize::new(0);
        small_streamer()
            .stream_with_progress(&mut source, &mut sink, &mut |n| {
                total.fetch_add(n, Ordering::Relaxed);
            })
            .unwrap();
        assert_eq!(total.load(Ordering::Relaxed), 5_000);
    }

    #[test]
    fn sink_error_propagates_without_hanging() {
        let mut source = SliceSource::new(pattern(100_000), 1000);
        let mut sink = FailingSink { accepted: 0, budget: 100 };
        let err = small_streamer().stream(&mut source, &mut sink).unwrap_err();
        assert!(matches!(err, StreamError::Io(_)));
    }

    #[test]
    fn forked_finish_without_starvation() {
        let data = pattern(100);
        let streamer = MultiThreadedStreamer::new(MultiThreadedStreamerOptions {
            num_buffers: 8,
            bytes_per_buffer: 64,
        });
        let mut source = SliceSource::new(data.clone(), 13);
        let mut primary = VecSink::default();
        let mut secondary = VecSink::default();
        streamer
            .forked_stream(ForkedStream {
                source: &mut source,
                primary_sink: &mut primary,
                secondary_sink: &mut secondary,
                primary_done: &mut || SecondaryStreamDecision::Finish,
                primary_progress: &mut |_| {},
                secondary_progress: &mut |_| {},
            })
            .unwrap();
        assert_eq!(primary.0, data);
        assert_eq!(secondary.0, data);
    }

    #[test]
    fn forked_finish_rewinds_after_starvation() {
        // Two 8-byte secondary buffers cannot hold 4 KiB: the secondary
        // starves, and Finish must rewind the source to complete it.
        let data = pattern(4096);
        let streamer = MultiThreadedStreamer::new(MultiThreadedStreamerOptions {
            num_buffers: 2,
            bytes_per_buffer: 8,
        });
        let mut source = SliceSource::new(data.clone(), 8);
        let mut primary = VecSink::default();
        let mut secondary = VecSink::default();
        let decisions = AtomicUsize::new(0);
        streamer
            .forked_stream(ForkedStream {
                source: &mut source,
                primary_sink: &mut primary,
                secondary_sink: &mut secondary,
                primary_done: &mut || {
                    decisions.fetch_add(1, Ordering::Relaxed);
                    SecondaryStreamDecision::Finish
                },
                primary_progress: &mut |_| {},
                secondary_progress: &mut |_| {},
            })
            .unwrap();
        assert_eq!(decisions.load(Ordering::Relaxed), 1);
        assert_eq!(primary.0, data);
        assert_eq!(secondary.0, data);
    }

    #[test]
    fn forked_abandon_cancels_secondary() {
        let data = pattern(4096);
        let streamer = MultiThreadedStreamer::new(MultiThreadedStreamerOptions {
            num_buffers: 2,
            bytes_per_buffer: 8,
        });
        let mut source = SliceSource::new(data.clone(), 8);
        let mut primary = VecSink::default();
        let mut secondary = VecSink::default();
        streamer
            .forked_stream(ForkedStream {
                source: &mut source,
                primary_sink: &mut primary,
                secondary_sink: &mut secondary,
                primary_done: &mut || SecondaryStreamDecision::Abandon,
                primary_progress: &mut |_| {},
                secondary_progress: &mut |_| {},
            })
            .unwrap();
        assert_eq!(primary.0, data);
        // The secondary got at most what fit in its pool before starvation,
        // and what it got is a prefix in source order.
        assert!(secondary.0.len() < data.len());
        assert_eq!(secondary.0, data[..secondary.0.len()]);
    }

    #[test]
    fn forked_primary_fault_propagates() {
        let streamer = small_streamer();
        let mut source = SliceSource::new(pattern(100_000), 1000);
        let mut primary = FailingSink { accepted: 0, budget: 64 };
        let mut secondary = VecSink::default();
        let err = streamer
            .forked_stream(ForkedStream {
                source: &mut source,
                primary_sink: &mut primary,
                secondary_sink: &mut secondary,
                primary_done: &mut || SecondaryStreamDecision::Finish,
                primary_progress: &mut |_| {},
                secondary_progress: &mut |_| {},
            })
            .unwrap_err();
        assert!(matches!(err, StreamError::Io(_)));
    }

    #[test]
    fn forked_empty_source() {
        let streamer = small_streamer();
        let mut source = SliceSource::new(Vec::new(), 8);
        let mut primary = VecSink::default();
        let mut secondary = VecSink::default();
        streamer
            .forked_stream(ForkedStream {
                source: &mut source,
                primary_sink: &mut primary,
                secondary_sink: &mut secondary,
                primary_done: &mut || SecondaryStreamDecision::Finish,
                primary_progress: &mut |_| {},
                secondary_progress: &mut |_| {},
            })
            .unwrap();
        assert!(primary.0.is_empty());
        assert!(secondary.0.is_empty());
    }

    #[test]
    fn forked_secondary_fault_propagates_when_finishing() {
        let data = pattern(10_000);
        let streamer = small_streamer();
        let mut source = SliceSource::new(data, 64);
        let mut primary = VecSink::default();
        let mut secondary = FailingSink { accepted: 0, budget: 64 };
        let err = streamer
            .forked_stream(ForkedStream {
                source: &mut source,
                primary_sink: &mut primary,
                secondary_sink: &mut secondary,
                primary_done: &mut || SecondaryStreamDecision::Finish,
                primary_progress: &mut |_| {},
                secondary_progress: &mut |_| {},
            })
            .unwrap_err();
        assert!(matches!(err, StreamError::Io(_)));
        assert_eq!(primary.0.len(), 10_000);
    }

    #[test]
    fn forked_secondary_fault_is_moot_when_abandoning() {
        let data = pattern(10_000);
        let streamer = small_streamer();
        let mut source = SliceSource::new(data.clone(), 64);
        let mut primary = VecSink::default();
        let mut secondary = FailingSink { accepted: 0, budget: 0 };
        streamer
            .forked_stream(ForkedStream {
                source: &mut source,
                primary_sink: &mut primary,
                secondary_sink: &mut secondary,
                primary_done: &mut || SecondaryStreamDecision::Abandon,
                primary_progress: &mut |_| {},
                secondary_progress: &mut |_| {},
            })
            .unwrap();
        assert_eq!(primary.0, data);
    }

    #[test]
    fn lazy_allocation_stays_within_the_ceiling() {
        // A large transfer through a two-buffer pool completes and stays in
        // order; the pool cannot allocate its way out of backpressure.
        let data = pattern(1 << 20);
        let streamer = MultiThreadedStreamer::new(MultiThreadedStreamerOptions {
            num_buffers: 2,
            bytes_per_buffer: 1024,
        });
        let mut source = SliceSource::new(data.clone(), 4096);
        let mut sink = VecSink::default();
        streamer.stream(&mut source, &mut sink).unwrap();
        assert_eq!(sink.0, data);
    }

    #[test]
    fn forked_progress_covers_both_sinks() {
        let data = pattern(512);
        let streamer = MultiThreadedStreamer::new(MultiThreadedStreamerOptions {
            num_buffers: 4,
            bytes_per_buffer: 32,
        });
        let mut source = SliceSource::new(data.clone(), 32);
        let mut primary = VecSink::default();
        let mut secondary = VecSink::default();
        let p_total = AtomicUsize::new(0);
        let s_total = AtomicUsize::new(0);
        streamer
            .forked_stream(ForkedStream {
                source: &mut source,
                primary_sink: &mut primary,
                secondary_sink: &mut secondary,
                primary_done: &mut || SecondaryStreamDecision::Finish,
                primary_progress: &mut |n| {
                    p_total.fetch_add(n, Ordering::Relaxed);
                },
                secondary_progress: &mut |n| {
                    s_total.fetch_add(n, Ordering::Relaxed);
                },
            })
            .unwrap();
        assert_eq!(p_total.load(Ordering::Relaxed), data.len());
        assert_eq!(s_total.load(Ordering::Relaxed), data.len());
    }
}
