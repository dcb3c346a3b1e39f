//! Frame ring behavior against the mock device, with GPU completion
//! driven from another thread where timing matters.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use ash::vk::{self, Handle};
use ember_renderer::clear_pass::{ClearPass, DEFAULT_PALETTE};
use ember_renderer::frame_manager::{
    FrameEnd, FrameInfo, FrameManager, FrameManagerDesc, FrameStart, FrameTimeouts,
};
use ember_rhi::backend::{AcquireOutcome, GpuDevice, PresentOutcome, QueueKind};
use ember_rhi::descriptor_allocator::{DescriptorAllocator, GrowthPolicy, PoolSizeRatio};
use ember_rhi::immediate::ImmediateSubmit;
use ember_rhi::mock::{GpuMode, MockDevice, MockEvent, MockPresenter};
use ember_rhi::resource::ResourceKind;

fn desc(frames_in_flight: usize) -> FrameManagerDesc {
    FrameManagerDesc {
        frames_in_flight,
        frame_descriptor_sets: 8,
        frame_pool_ratios: vec![PoolSizeRatio::new(vk::DescriptorType::UNIFORM_BUFFER, 1.0)],
        timeouts: FrameTimeouts {
            fence: Duration::from_secs(2),
            acquire: Duration::from_secs(1),
            flush: Duration::from_secs(2),
        },
        ..Default::default()
    }
}

fn ready(start: FrameStart) -> FrameInfo {
    match start {
        FrameStart::Ready(info) => info,
        FrameStart::SwapchainStale => panic!("unexpected stale swapchain"),
    }
}

/// Completes submissions one at a time until stopped.
struct GpuThread {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl GpuThread {
    fn spawn(device: Arc<MockDevice>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = thread::spawn({
            let stop = stop.clone();
            move || {
                while !stop.load(Ordering::Acquire) {
                    if !device.complete_next() {
                        thread::sleep(Duration::from_micros(200));
                    }
                }
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for GpuThread {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap();
        }
    }
}

fn clear_pass(device: &Arc<MockDevice>) -> (ClearPass<MockDevice>, DescriptorAllocator<MockDevice>) {
    let immediate =
        ImmediateSubmit::new(device.clone(), QueueKind::Graphics, Duration::from_secs(1)).unwrap();
    let mut global = DescriptorAllocator::new(
        device.clone(),
        4,
        &[PoolSizeRatio::new(vk::DescriptorType::STORAGE_BUFFER, 1.0)],
        GrowthPolicy::default(),
    )
    .unwrap();
    let pass = ClearPass::new(device.clone(), &immediate, &mut global, &DEFAULT_PALETTE).unwrap();
    (pass, global)
}

#[test]
fn test_cpu_never_runs_more_than_ring_depth_ahead() {
    const FRAMES: usize = 3;

    let device = MockDevice::with_mode(GpuMode::Manual);
    let presenter = MockPresenter::new(device.clone(), 3);
    let mut frames = FrameManager::new(device.clone(), desc(FRAMES)).unwrap();
    let gpu = GpuThread::spawn(device.clone());

    for k in 0..(3 * FRAMES as u64) {
        let info = ready(frames.begin_frame(&presenter).unwrap());
        assert_eq!(info.frame_number, k);
        assert!(
            device.in_flight() < FRAMES,
            "frame {k} began with {} submissions in flight",
            device.in_flight()
        );
        assert_eq!(frames.end_frame(&presenter).unwrap(), FrameEnd::Presented);
    }

    frames.wait_all(Duration::from_secs(2)).unwrap();
    drop(gpu);
    assert_eq!(device.in_flight(), 0);
    assert!(device.violations().is_empty(), "{:?}", device.violations());
}

#[test]
fn test_each_slot_fence_is_waited_once_per_reuse() {
    const FRAMES: usize = 2;
    const ROUNDS: usize = 3;

    let device = MockDevice::with_mode(GpuMode::CompleteOnWait);
    let presenter = MockPresenter::new(device.clone(), 3);
    let (pass, _global) = clear_pass(&device);
    let mut frames = FrameManager::new(device.clone(), desc(FRAMES)).unwrap();

    let mut uses = [0usize; FRAMES];
    for _ in 0..(ROUNDS * FRAMES) {
        let info = ready(frames.begin_frame(&presenter).unwrap());
        uses[info.slot] += 1;
        pass.record(frames.current_slot_mut().unwrap(), &info, &presenter, 0.0)
            .unwrap();
        frames.end_frame(&presenter).unwrap();
    }

    for (i, &count) in uses.iter().enumerate() {
        assert_eq!(count, ROUNDS);
        let fence = frames.slot(i).unwrap().fence().handle();
        assert_eq!(device.fence_waits(fence), count, "slot {i}");
    }
    assert!(device.violations().is_empty(), "{:?}", device.violations());
}

#[test]
fn test_submit_and_present_use_the_slot_semaphores() {
    let device = MockDevice::new();
    let presenter = MockPresenter::new(device.clone(), 2);
    let mut frames = FrameManager::new(device.clone(), desc(2)).unwrap();

    for _ in 0..4 {
        let info = ready(frames.begin_frame(&presenter).unwrap());
        let slot = frames.slot(info.slot).unwrap();
        let acquired = slot.image_acquired().handle().as_raw();
        let complete = slot.render_complete().handle().as_raw();
        let fence = slot.fence().handle().as_raw();
        let cmd = slot.command_buffer().handle().as_raw();

        device.clear_events();
        frames.end_frame(&presenter).unwrap();
        let events = device.events();

        let submit = events
            .iter()
            .find_map(|e| match e {
                MockEvent::Submit {
                    queue,
                    command_buffers,
                    waits,
                    signals,
                    fence,
                } => Some((*queue, command_buffers.clone(), waits.clone(), signals.clone(), *fence)),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            submit,
            (QueueKind::Graphics, vec![cmd], vec![acquired], vec![complete], fence)
        );

        assert!(events.contains(&MockEvent::Present {
            image_index: info.image_index,
            wait: complete,
            outcome: PresentOutcome::Presented,
        }));
    }
}

#[test]
fn test_frame_resources_are_released_after_their_fence() {
    let device = MockDevice::with_mode(GpuMode::CompleteOnWait);
    let presenter = MockPresenter::new(device.clone(), 2);
    let (pass, _global) = clear_pass(&device);
    let mut frames = FrameManager::new(device.clone(), desc(2)).unwrap();
    // The palette staging buffer.
    let baseline = device.destroyed_of_kind(ResourceKind::Buffer);

    for _ in 0..2 {
        let info = ready(frames.begin_frame(&presenter).unwrap());
        let slot = frames.current_slot_mut().unwrap();
        pass.record(slot, &info, &presenter, 0.0).unwrap();
        assert_eq!(slot.pending_deletions(), 1);
        frames.end_frame(&presenter).unwrap();
    }
    assert_eq!(device.destroyed_of_kind(ResourceKind::Buffer), baseline);

    // Slot 0 comes around: only frame 0 is waited for and released.
    let slot0_fence = frames.slot(0).unwrap().fence().handle().as_raw();
    ready(frames.begin_frame(&presenter).unwrap());
    assert_eq!(device.destroyed_of_kind(ResourceKind::Buffer), baseline + 1);
    assert_eq!(frames.slot(0).unwrap().pending_deletions(), 0);
    assert_eq!(frames.slot(1).unwrap().pending_deletions(), 1);

    let events = device.events();
    let signaled = events
        .iter()
        .position(|e| *e == MockEvent::FenceSignaled(slot0_fence))
        .unwrap();
    let destroyed = events
        .iter()
        .rposition(|e| matches!(e, MockEvent::Destroy(ResourceKind::Buffer, _)))
        .unwrap();
    assert!(signaled < destroyed);

    frames.end_frame(&presenter).unwrap();
    frames.shutdown().unwrap();
    assert_eq!(device.destroyed_of_kind(ResourceKind::Buffer), baseline + 2);
    assert!(device.violations().is_empty(), "{:?}", device.violations());
}

#[test]
fn test_frame_descriptor_sets_come_from_the_slot_allocator() {
    let device = MockDevice::new();
    let presenter = MockPresenter::new(device.clone(), 2);
    let (pass, _global) = clear_pass(&device);
    let mut frames = FrameManager::new(device.clone(), desc(2)).unwrap();

    let info = ready(frames.begin_frame(&presenter).unwrap());
    let slot = frames.current_slot_mut().unwrap();
    let set = pass.record(slot, &info, &presenter, 0.0).unwrap();
    assert_ne!(set, pass.palette_set());
    assert!(device.events().contains(&MockEvent::UpdateDescriptors {
        set: set.as_raw(),
        writes: 1,
    }));
    // Barrier, clear, barrier.
    assert_eq!(
        device.recorded_commands(frames.current_slot().unwrap().command_buffer().handle()),
        3
    );
    frames.end_frame(&presenter).unwrap();
}

#[test]
fn test_stale_swapchain_is_recovered_without_violations() {
    let device = MockDevice::with_mode(GpuMode::Manual);
    let presenter = MockPresenter::new(device.clone(), 3);
    let (pass, _global) = {
        // The palette upload needs its fence signaled.
        let _gpu = GpuThread::spawn(device.clone());
        clear_pass(&device)
    };
    let mut frames = FrameManager::new(device.clone(), desc(2)).unwrap();
    let gpu = GpuThread::spawn(device.clone());

    presenter.script_acquire(AcquireOutcome::Acquired {
        image_index: 0,
        suboptimal: false,
    });
    presenter.script_acquire(AcquireOutcome::OutOfDate);

    let mut presented = Vec::new();
    let mut rebuilds = 0;
    while presented.len() < 6 {
        let info = match frames.begin_frame(&presenter).unwrap() {
            FrameStart::Ready(info) => info,
            FrameStart::SwapchainStale => {
                device.wait_idle().unwrap();
                frames.renew_semaphores().unwrap();
                rebuilds += 1;
                continue;
            }
        };
        let slot = frames.current_slot_mut().unwrap();
        pass.record(slot, &info, &presenter, 0.0).unwrap();
        frames.end_frame(&presenter).unwrap();
        presented.push(info.frame_number);
    }

    frames.shutdown().unwrap();
    drop(gpu);
    assert_eq!(rebuilds, 1);
    assert_eq!(presented, vec![0, 1, 2, 3, 4, 5]);
    assert!(device.violations().is_empty(), "{:?}", device.violations());
}

#[test]
fn test_shutdown_with_frames_in_flight_releases_everything() {
    let device = MockDevice::with_mode(GpuMode::Manual);
    let presenter = MockPresenter::new(device.clone(), 3);
    let gpu = GpuThread::spawn(device.clone());
    let (pass, global) = clear_pass(&device);
    let mut frames = FrameManager::new(device.clone(), desc(3)).unwrap();

    for _ in 0..5 {
        let info = ready(frames.begin_frame(&presenter).unwrap());
        pass.record(frames.current_slot_mut().unwrap(), &info, &presenter, 0.0)
            .unwrap();
        frames.end_frame(&presenter).unwrap();
    }

    frames.shutdown().unwrap();
    drop(gpu);
    for i in 0..3 {
        assert_eq!(frames.slot(i).unwrap().pending_deletions(), 0);
    }

    drop(frames);
    drop(pass);
    drop(global);
    assert_eq!(device.live_buffers(), 0);
    assert_eq!(device.live_descriptor_pools(), 0);
    assert_eq!(device.live_fences(), 0);
    assert!(device.violations().is_empty(), "{:?}", device.violations());
}
