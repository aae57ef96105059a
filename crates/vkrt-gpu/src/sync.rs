//! Fence-based submission.
//!
//! Synchronous submission blocks on a per-call fence. Asynchronous submission
//! runs in two stages on the rayon pool: the first waits on the fence, the
//! second destroys it and runs the completion callback. The fence is never
//! destroyed while the first stage can still observe it.

use std::sync::Arc;

use ash::vk;

use crate::command::{create_command_buffer, CommandDevice};
use crate::error::{GpuError, Result};

/// Upper bound for a fence wait (100 seconds).
pub const DEFAULT_FENCE_TIMEOUT: u64 = 100_000_000_000;

/// Release a fence after a wait, unless the wait timed out.
///
/// A timed-out fence may still be referenced by in-flight work, so it is
/// leaked instead of destroyed.
unsafe fn retire_fence<D: CommandDevice + ?Sized>(
    device: &D,
    fence: vk::Fence,
    waited: &Result<()>,
) {
    if let Err(GpuError::FenceTimeout { timeout_ns }) = waited {
        tracing::error!(?fence, timeout_ns, "Fence wait timed out, leaking fence");
    } else {
        device.destroy_fence(fence);
    }
}

/// Submit command buffers and block until they complete.
///
/// An empty `cmds` slice is a no-op: nothing is submitted and no fence is
/// created. `submit_info` may carry semaphores; its command buffer list is
/// replaced by `cmds`.
///
/// # Safety
/// The queue and command buffers must be valid and the command buffers
/// executable.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn submit_cmd<'a, D: CommandDevice + ?Sized>(
    device: &D,
    queue: vk::Queue,
    cmds: &'a [vk::CommandBuffer],
    submit_info: vk::SubmitInfo<'a>,
) -> Result<()> {
    if cmds.is_empty() {
        return Ok(());
    }

    let submit_info = submit_info.command_buffers(cmds);
    let fence = device.create_fence(false)?;

    if let Err(e) = device.queue_submit(queue, std::slice::from_ref(&submit_info), fence) {
        device.destroy_fence(fence);
        return Err(e);
    }

    let waited = device.wait_for_fence(fence, DEFAULT_FENCE_TIMEOUT);
    retire_fence(device, fence, &waited);
    waited
}

/// Submit command buffers and return immediately.
///
/// `on_complete` runs on a rayon worker once the fence has signaled (or the
/// wait failed), after the fence has been destroyed. It never runs on the
/// calling thread and may run before or after this function returns. An
/// empty `cmds` slice submits nothing and drops `on_complete` unrun.
///
/// # Safety
/// The queue and command buffers must be valid and must stay alive until
/// `on_complete` runs.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn submit_cmd_async<'a, D, F>(
    device: &Arc<D>,
    queue: vk::Queue,
    cmds: &'a [vk::CommandBuffer],
    submit_info: vk::SubmitInfo<'a>,
    on_complete: F,
) -> Result<()>
where
    D: CommandDevice,
    F: FnOnce(Result<()>) + Send + 'static,
{
    if cmds.is_empty() {
        return Ok(());
    }

    let submit_info = submit_info.command_buffers(cmds);
    let fence = device.create_fence(false)?;

    if let Err(e) = device.queue_submit(queue, std::slice::from_ref(&submit_info), fence) {
        device.destroy_fence(fence);
        return Err(e);
    }

    let device = Arc::clone(device);
    rayon::spawn(move || {
        let waited = unsafe { device.wait_for_fence(fence, DEFAULT_FENCE_TIMEOUT) };
        rayon::spawn(move || {
            unsafe { retire_fence(&*device, fence, &waited) };
            on_complete(waited);
        });
    });

    Ok(())
}

/// Record a one-shot primary command buffer, submit it and wait.
///
/// The command buffer is freed afterwards, except after a fence timeout
/// when it may still be executing.
///
/// # Safety
/// The pool must belong to the queue's family and be externally
/// synchronized.
pub unsafe fn submit_once<D, F>(
    device: &D,
    queue: vk::Queue,
    pool: vk::CommandPool,
    record: F,
) -> Result<()>
where
    D: CommandDevice + ?Sized,
    F: FnOnce(vk::CommandBuffer),
{
    let cmd = create_command_buffer(device, pool, false, true)?;
    record(cmd);

    let cmds = [cmd];
    let result = device
        .end_command_buffer(cmd)
        .and_then(|()| submit_cmd(device, queue, &cmds, vk::SubmitInfo::default()));

    if !matches!(result, Err(GpuError::FenceTimeout { .. })) {
        device.free_command_buffers(pool, &cmds);
    }
    result
}

/// Record a one-shot primary command buffer and submit it without waiting.
///
/// `on_complete` receives the command buffer and the wait result; the
/// buffer is freed only after `on_complete` returns.
///
/// # Safety
/// The pool must belong to the queue's family. Freeing happens on a rayon
/// worker, so the pool must not be used concurrently from other threads
/// while submissions are in flight.
pub unsafe fn submit_once_async<D, R, F>(
    device: &Arc<D>,
    queue: vk::Queue,
    pool: vk::CommandPool,
    record: R,
    on_complete: F,
) -> Result<()>
where
    D: CommandDevice,
    R: FnOnce(vk::CommandBuffer),
    F: FnOnce(vk::CommandBuffer, Result<()>) + Send + 'static,
{
    let cmd = create_command_buffer(&**device, pool, false, true)?;
    record(cmd);

    if let Err(e) = device.end_command_buffer(cmd) {
        device.free_command_buffers(pool, &[cmd]);
        return Err(e);
    }

    let cmds = [cmd];
    let owner = Arc::clone(device);
    let submitted = submit_cmd_async(device, queue, &cmds, vk::SubmitInfo::default(), move |waited| {
        let timed_out = matches!(waited, Err(GpuError::FenceTimeout { .. }));
        on_complete(cmd, waited);
        if !timed_out {
            unsafe { owner.free_command_buffers(pool, &[cmd]) };
        }
    });

    if submitted.is_err() {
        device.free_command_buffers(pool, &cmds);
    }
    submitted
}
