//! Fence-based submission driven through a fake device whose fences signal
//! on demand.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ash::vk::{self, Handle};
use crossbeam::channel::{unbounded, RecvTimeoutError};
use parking_lot::{Condvar, Mutex};
use vkrt_gpu::command::BarrierMasks;
use vkrt_gpu::{
    command_barrier, create_command_buffer, from_host_command_barrier, submit_cmd, submit_cmd_async,
    submit_once, submit_once_async, to_host_command_barrier, BarrierKind, CommandDevice, GpuError,
};

#[derive(Clone, Debug, PartialEq)]
enum Event {
    Allocated(u64),
    Begun {
        cmd: u64,
        flags: vk::CommandBufferUsageFlags,
        inherits: bool,
    },
    Ended(u64),
    Barrier(BarrierMasks),
    FenceCreated(u64),
    Submitted { cmds: Vec<u64>, fence: u64 },
    FenceDestroyed(u64),
    Freed(u64),
    Callback,
}

struct FakeDevice {
    next_handle: AtomicU64,
    auto_signal: AtomicBool,
    wait_limit: Mutex<Option<Duration>>,
    fences: Mutex<HashMap<u64, bool>>,
    fence_signaled: Condvar,
    events: Mutex<Vec<Event>>,
}

impl FakeDevice {
    fn new(auto_signal: bool) -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            auto_signal: AtomicBool::new(auto_signal),
            wait_limit: Mutex::new(None),
            fences: Mutex::new(HashMap::new()),
            fence_signaled: Condvar::new(),
            events: Mutex::new(Vec::new()),
        }
    }

    fn with_wait_limit(self, limit: Duration) -> Self {
        *self.wait_limit.lock() = Some(limit);
        self
    }

    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn record(&self, event: Event) {
        self.events.lock().push(event);
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    fn position(&self, event: &Event) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }

    fn last_fence(&self) -> Option<u64> {
        self.events().iter().rev().find_map(|e| match e {
            Event::FenceCreated(fence) => Some(*fence),
            _ => None,
        })
    }

    fn signal(&self, fence: u64) {
        let mut fences = self.fences.lock();
        if let Some(signaled) = fences.get_mut(&fence) {
            *signaled = true;
        }
        self.fence_signaled.notify_all();
    }

    fn live_fences(&self) -> usize {
        self.fences.lock().len()
    }
}

impl CommandDevice for FakeDevice {
    unsafe fn allocate_command_buffer(
        &self,
        _pool: vk::CommandPool,
        _level: vk::CommandBufferLevel,
    ) -> vkrt_gpu::Result<vk::CommandBuffer> {
        let raw = self.handle();
        self.record(Event::Allocated(raw));
        Ok(vk::CommandBuffer::from_raw(raw))
    }

    unsafe fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        begin_info: &vk::CommandBufferBeginInfo<'_>,
    ) -> vkrt_gpu::Result<()> {
        self.record(Event::Begun {
            cmd: cmd.as_raw(),
            flags: begin_info.flags,
            inherits: !begin_info.p_inheritance_info.is_null(),
        });
        Ok(())
    }

    unsafe fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> vkrt_gpu::Result<()> {
        self.record(Event::Ended(cmd.as_raw()));
        Ok(())
    }

    unsafe fn free_command_buffers(&self, _pool: vk::CommandPool, cmds: &[vk::CommandBuffer]) {
        for cmd in cmds {
            self.record(Event::Freed(cmd.as_raw()));
        }
    }

    unsafe fn cmd_memory_barrier(&self, _cmd: vk::CommandBuffer, masks: &BarrierMasks) {
        self.record(Event::Barrier(*masks));
    }

    unsafe fn create_fence(&self, signaled: bool) -> vkrt_gpu::Result<vk::Fence> {
        let raw = self.handle();
        self.fences.lock().insert(raw, signaled);
        self.record(Event::FenceCreated(raw));
        Ok(vk::Fence::from_raw(raw))
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        self.fences.lock().remove(&fence.as_raw());
        self.record(Event::FenceDestroyed(fence.as_raw()));
    }

    unsafe fn queue_submit(
        &self,
        _queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> vkrt_gpu::Result<()> {
        let cmds = submits
            .iter()
            .flat_map(|s| {
                std::slice::from_raw_parts(s.p_command_buffers, s.command_buffer_count as usize)
            })
            .map(|c| c.as_raw())
            .collect();
        self.record(Event::Submitted {
            cmds,
            fence: fence.as_raw(),
        });
        if self.auto_signal.load(Ordering::Relaxed) {
            self.signal(fence.as_raw());
        }
        Ok(())
    }

    unsafe fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> vkrt_gpu::Result<()> {
        let mut timeout = Duration::from_nanos(timeout_ns);
        if let Some(limit) = *self.wait_limit.lock() {
            timeout = timeout.min(limit);
        }
        let deadline = Instant::now() + timeout;

        let mut fences = self.fences.lock();
        loop {
            if fences.get(&fence.as_raw()).copied().unwrap_or(false) {
                return Ok(());
            }
            if self.fence_signaled.wait_until(&mut fences, deadline).timed_out() {
                return if fences.get(&fence.as_raw()).copied().unwrap_or(false) {
                    Ok(())
                } else {
                    Err(GpuError::FenceTimeout { timeout_ns })
                };
            }
        }
    }
}

const QUEUE: vk::Queue = vk::Queue::null();
const POOL: vk::CommandPool = vk::CommandPool::null();
const LONG: Duration = Duration::from_secs(5);

#[test]
fn empty_submit_creates_no_fence() {
    let device = FakeDevice::new(true);
    let result = unsafe { submit_cmd(&device, QUEUE, &[], vk::SubmitInfo::default()) };
    assert!(result.is_ok());
    assert!(device.events().is_empty());
}

#[test]
fn empty_async_submit_drops_callback() {
    let device = Arc::new(FakeDevice::new(true));
    let (tx, rx) = unbounded();
    let result = unsafe {
        submit_cmd_async(&device, QUEUE, &[], vk::SubmitInfo::default(), move |r| {
            let _ = tx.send(r.is_ok());
        })
    };
    assert!(result.is_ok());
    assert_eq!(rx.recv_timeout(LONG), Err(RecvTimeoutError::Disconnected));
    assert!(device.events().is_empty());
}

#[test]
fn sync_submit_waits_and_destroys_fence() {
    let device = FakeDevice::new(true);
    let cmd = vk::CommandBuffer::from_raw(0xC0);
    unsafe { submit_cmd(&device, QUEUE, &[cmd], vk::SubmitInfo::default()) }.unwrap();

    let fence = device.last_fence().unwrap();
    assert_eq!(
        device.events(),
        [
            Event::FenceCreated(fence),
            Event::Submitted {
                cmds: vec![0xC0],
                fence
            },
            Event::FenceDestroyed(fence),
        ]
    );
    assert_eq!(device.live_fences(), 0);
}

#[test]
fn async_callback_runs_after_signal() {
    let device = Arc::new(FakeDevice::new(false));
    let cmd = vk::CommandBuffer::from_raw(0xA0);
    let (tx, rx) = unbounded();
    let caller = std::thread::current().id();

    let observer = Arc::clone(&device);
    unsafe {
        submit_cmd_async(&device, QUEUE, &[cmd], vk::SubmitInfo::default(), move |result| {
            observer.record(Event::Callback);
            let _ = tx.send((result.is_ok(), std::thread::current().id()));
        })
    }
    .unwrap();

    let fence = device.last_fence().unwrap();
    assert_eq!(
        rx.recv_timeout(Duration::from_millis(200)),
        Err(RecvTimeoutError::Timeout)
    );
    assert!(device.position(&Event::Callback).is_none());

    device.signal(fence);
    let (ok, thread) = rx.recv_timeout(LONG).unwrap();
    assert!(ok);
    assert_ne!(thread, caller);

    let destroyed = device.position(&Event::FenceDestroyed(fence)).unwrap();
    let callback = device.position(&Event::Callback).unwrap();
    assert!(destroyed < callback);
}

#[test]
fn submit_once_records_and_frees() {
    let device = FakeDevice::new(true);
    let mut recorded = None;
    unsafe {
        submit_once(&device, QUEUE, POOL, |cmd| {
            recorded = Some(cmd.as_raw());
            from_host_command_barrier(&device, cmd);
        })
    }
    .unwrap();

    let cmd = recorded.unwrap();
    let events = device.events();
    assert_eq!(events[0], Event::Allocated(cmd));
    assert_eq!(
        events[1],
        Event::Begun {
            cmd,
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            inherits: false,
        }
    );
    assert_eq!(events[2], Event::Barrier(BarrierKind::FromHost.masks()));
    assert_eq!(events[3], Event::Ended(cmd));
    assert_eq!(events.last(), Some(&Event::Freed(cmd)));
}

#[test]
fn submit_once_async_frees_after_callback() {
    let device = Arc::new(FakeDevice::new(false));
    let (tx, rx) = unbounded();
    let observer = Arc::clone(&device);

    unsafe {
        submit_once_async(
            &device,
            QUEUE,
            POOL,
            |cmd| to_host_command_barrier(&*device, cmd),
            move |cmd, result| {
                observer.record(Event::Callback);
                let _ = tx.send((cmd.as_raw(), result.is_ok()));
            },
        )
    }
    .unwrap();

    let fence = device.last_fence().unwrap();
    device.signal(fence);
    let (cmd, ok) = rx.recv_timeout(LONG).unwrap();
    assert!(ok);

    // The free happens on the worker right after the callback returns.
    let deadline = Instant::now() + LONG;
    while device.position(&Event::Freed(cmd)).is_none() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    let callback = device.position(&Event::Callback).unwrap();
    let freed = device.position(&Event::Freed(cmd)).unwrap();
    assert!(callback < freed);
}

#[test]
fn timed_out_fence_is_leaked() {
    let device = FakeDevice::new(false).with_wait_limit(Duration::from_millis(20));
    let cmd = vk::CommandBuffer::from_raw(0xD0);

    let result = unsafe { submit_cmd(&device, QUEUE, &[cmd], vk::SubmitInfo::default()) };
    assert!(matches!(result, Err(GpuError::FenceTimeout { .. })));

    let fence = device.last_fence().unwrap();
    assert!(device.position(&Event::FenceDestroyed(fence)).is_none());
    assert_eq!(device.live_fences(), 1);
}

#[test]
fn timed_out_submit_once_keeps_command_buffer() {
    let device = FakeDevice::new(false).with_wait_limit(Duration::from_millis(20));
    let result = unsafe { submit_once(&device, QUEUE, POOL, |_| {}) };
    assert!(matches!(result, Err(GpuError::FenceTimeout { .. })));
    assert!(!device.events().iter().any(|e| matches!(e, Event::Freed(_))));
}

#[test]
fn timed_out_async_reports_error() {
    let device = Arc::new(FakeDevice::new(false).with_wait_limit(Duration::from_millis(20)));
    let cmd = vk::CommandBuffer::from_raw(0xE0);
    let (tx, rx) = unbounded();

    unsafe {
        submit_cmd_async(&device, QUEUE, &[cmd], vk::SubmitInfo::default(), move |result| {
            let _ = tx.send(matches!(result, Err(GpuError::FenceTimeout { .. })));
        })
    }
    .unwrap();

    assert!(rx.recv_timeout(LONG).unwrap());
    assert_eq!(device.live_fences(), 1);
}

#[test]
fn command_buffer_levels() {
    let device = FakeDevice::new(true);

    let secondary = unsafe { create_command_buffer(&device, POOL, true, true) }.unwrap();
    let primary = unsafe { create_command_buffer(&device, POOL, false, false) }.unwrap();

    let events = device.events();
    assert!(events.contains(&Event::Begun {
        cmd: secondary.as_raw(),
        flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        inherits: true,
    }));
    assert!(events.contains(&Event::Begun {
        cmd: primary.as_raw(),
        flags: vk::CommandBufferUsageFlags::SIMULTANEOUS_USE,
        inherits: false,
    }));
}

#[test]
fn barrier_helpers_record_their_masks() {
    let device = FakeDevice::new(true);
    let cmd = vk::CommandBuffer::from_raw(0xB0);
    unsafe {
        command_barrier(&device, cmd);
        from_host_command_barrier(&device, cmd);
        to_host_command_barrier(&device, cmd);
    }
    assert_eq!(
        device.events(),
        [
            Event::Barrier(BarrierKind::Device.masks()),
            Event::Barrier(BarrierKind::FromHost.masks()),
            Event::Barrier(BarrierKind::ToHost.masks()),
        ]
    );
}
