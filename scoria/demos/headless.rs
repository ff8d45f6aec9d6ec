//! Headless smoke run: a task graph produces a payload on the CPU pool,
//! the payload goes through a staging upload, and the device copy is
//! read back and verified against the source.

use std::sync::Arc;

use scoria::{
    vk, Buffer, BufferCreateDesc, CommandBufferScopeDesc, CommandPoolConfig, CommandPoolContext,
    Device, DeviceConfig, Executor, Instance, InstanceConfig, MemoryLocation, Queue, QueueConfig,
    TaskGraph,
};

const PAYLOAD_SIZE: usize = 4096;

fn main() -> scoria::Result<()> {
    tracing_subscriber::fmt().init();

    let instance = Instance::new(InstanceConfig::default())?;
    let device = Device::new(Arc::new(instance), DeviceConfig::default())?;
    let family = device.created_queue_families()[0];
    let mut queue = Queue::new(
        device.clone(),
        "main_queue",
        QueueConfig {
            queue_family_index: family,
            queue_index: 0,
        },
    );
    let mut context = CommandPoolContext::new(
        device.clone(),
        "main_pool",
        CommandPoolConfig {
            queue_family_index: family,
            ..Default::default()
        },
    )?;

    // Produce the payload on the worker pool.
    let executor = Executor::new();
    let mut graph = TaskGraph::new();
    let (_, payload_future) = graph.create_task(
        || {
            (0..PAYLOAD_SIZE)
                .map(|i| (i % 251) as u8)
                .collect::<Vec<u8>>()
        },
        (),
    );
    executor.submit(graph)?;
    let payload = executor.join(payload_future);

    // Upload through staging, then copy back out for verification.
    let upload = Buffer::with_data(
        &device,
        &mut context,
        "payload",
        BufferCreateDesc {
            size: PAYLOAD_SIZE as vk::DeviceSize,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            memory: MemoryLocation::GpuOnly,
        },
        &payload,
    )?;
    let readback = Buffer::new(
        &device,
        "readback",
        BufferCreateDesc {
            size: PAYLOAD_SIZE as vk::DeviceSize,
            usage: vk::BufferUsageFlags::TRANSFER_DST,
            memory: MemoryLocation::GpuToCpu,
        },
    )?;
    {
        let scope = context.commands(CommandBufferScopeDesc::default())?;
        let barrier = vk::BufferMemoryBarrier {
            src_access_mask: vk::AccessFlags::TRANSFER_WRITE,
            dst_access_mask: vk::AccessFlags::TRANSFER_READ,
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            buffer: upload.handle(),
            offset: 0,
            size: vk::WHOLE_SIZE,
            ..Default::default()
        };
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: PAYLOAD_SIZE as vk::DeviceSize,
        };
        unsafe {
            device.handle().cmd_pipeline_barrier(
                scope.command_buffer(),
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[barrier],
                &[],
            );
            device.handle().cmd_copy_buffer(
                scope.command_buffer(),
                upload.handle(),
                readback.handle(),
                &[region],
            );
        }
    }

    let timeline_value = context.submit_level(&mut queue, 0)?;
    device.wait_timeline_value(timeline_value, u64::MAX)?;
    device.process_timeline_callbacks()?;

    assert_eq!(readback.mapped_slice().unwrap(), &payload[..]);
    println!("round-tripped {PAYLOAD_SIZE} bytes at timeline value {timeline_value}");

    drop((upload, readback));
    device.drain()?;
    Ok(())
}
