//! Runs a simulated decoder and a display consumer on two threads, sharing
//! frames through a slot set and buffers from a buffer service.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::{Arg, Command};
use codecbuf::buffer::{BufferMode, BufferService, GroupId, ServiceConfig};
use codecbuf::frame::Frame;
use codecbuf::memory::BufferType;
use codecbuf::slot::*;
use codecbuf::PixelFormat;
use codecbuf_utils::framegen::FrameGenerator;

/// Signaled every time a buffer goes back to its group, which is also when a
/// slot has been freed.
#[derive(Default)]
struct Released {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Released {
    fn signal(&self) {
        *self.count.lock().unwrap() += 1;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let count = self.count.lock().unwrap();
        let _ = self
            .cond
            .wait_timeout(count, Duration::from_millis(10))
            .unwrap();
    }
}

fn parse_size(s: &str) -> anyhow::Result<(u32, u32)> {
    let (width, height) = s
        .split_once('x')
        .with_context(|| format!("invalid frame size {:?}", s))?;

    Ok((width.parse()?, height.parse()?))
}

fn decode(
    slots: &SlotSet,
    group: GroupId,
    released: &Released,
    sizes: [(u32, u32); 2],
    resize_at: usize,
    num_frames: usize,
    lets_quit: &AtomicBool,
) -> anyhow::Result<()> {
    let service = slots.service();
    let mut gen: Option<FrameGenerator> = None;

    for n in 0..num_frames {
        if lets_quit.load(Ordering::SeqCst) {
            break;
        }

        let index = loop {
            match slots.get_unused() {
                Ok(index) => break index,
                Err(SlotError::NoFreeSlot) => released.wait(),
                Err(e) => return Err(e.into()),
            }
        };

        let (width, height) = if n < resize_at { sizes[0] } else { sizes[1] };
        let mut frame = Frame::new(PixelFormat::NV12, width, height);
        frame.pts = n as i64;
        frame.eos = n + 1 == num_frames;
        slots.set_prop(index, SlotValue::Frame(frame))?;

        if slots.is_changed() {
            // Let display drain the frames of the old geometry.
            while slots.used_count() > 1 && !lets_quit.load(Ordering::SeqCst) {
                released.wait();
            }
            slots.ready();
            service.group_reset(group)?;
            let info = slots.frame_info();
            println!("Frame {}: new geometry {}", n, info);
            gen = Some(FrameGenerator::new(info)?);
        }
        let gen = match gen.as_mut() {
            Some(gen) => gen,
            None => bail!("no geometry negotiated"),
        };

        let buffer = service.buffer_get(group, "frame", slots.get_size())?;
        slots.set_prop(index, SlotValue::Buffer(buffer))?;
        service.buffer_ref_dec(buffer)?;

        // Queue the slot right away, display waits until the hardware is done
        // writing it.
        slots.set_flag(index, SlotUsage::HalOutput)?;
        slots.set_flag(index, SlotUsage::QueueUse)?;
        slots.enqueue(index, SlotQueue::Display)?;
        gen.write_to(service, buffer)?;
        slots.clr_flag(index, SlotUsage::HalOutput)?;
    }

    Ok(())
}

fn display(slots: &SlotSet, lets_quit: &AtomicBool) -> anyhow::Result<usize> {
    let service = slots.service();
    let mut displayed = 0;
    let mut checksum = 0u64;

    while !lets_quit.load(Ordering::SeqCst) {
        let index = match slots.dequeue(SlotQueue::Display) {
            Ok(index) => index,
            Err(SlotError::QueueEmpty(_)) | Err(SlotError::NotReady(_)) => {
                thread::sleep(Duration::from_millis(1));
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let frame = slots
            .get_frame(index)?
            .context("dequeued slot has no frame")?;
        if let Some(buffer) = frame.buffer {
            let mut luma = [0u8; 16];
            service.buffer_read(buffer, 0, &mut luma)?;
            checksum = luma
                .iter()
                .fold(checksum, |sum, &b| sum.wrapping_mul(31).wrapping_add(b as u64));
        }
        displayed += 1;
        slots.clr_flag(index, SlotUsage::QueueUse)?;

        if frame.eos {
            break;
        }
    }

    println!("Checksum of displayed frames: {:#018x}", checksum);
    Ok(displayed)
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let matches = Command::new("Slot pipeline")
        .arg(
            Arg::new("num_frames")
                .long("stop_after")
                .takes_value(true)
                .default_value("100")
                .help("Stop after decoding a given number of frames"),
        )
        .arg(
            Arg::new("frame_size")
                .long("frame_size")
                .takes_value(true)
                .default_value("640x480")
                .help("Size of the first frames (e.g. \"640x480\")"),
        )
        .arg(
            Arg::new("new_size")
                .long("new_size")
                .takes_value(true)
                .default_value("1280x720")
                .help("Size of the frames after the resolution change"),
        )
        .arg(
            Arg::new("resize_at")
                .long("resize_at")
                .takes_value(true)
                .help("Frame at which the resolution changes (default: halfway)"),
        )
        .arg(
            Arg::new("slots")
                .long("slots")
                .takes_value(true)
                .default_value("4")
                .help("Number of slots to set up"),
        )
        .get_matches();

    let num_frames: usize = matches.value_of_t("num_frames")?;
    let num_slots: usize = matches.value_of_t("slots")?;
    if num_frames == 0 || num_slots == 0 {
        bail!("at least one frame and one slot are required");
    }
    let resize_at = match matches.value_of("resize_at") {
        Some(v) => v.parse()?,
        None => num_frames / 2,
    };
    let sizes = [
        parse_size(matches.value_of("frame_size").unwrap_or("640x480"))?,
        parse_size(matches.value_of("new_size").unwrap_or("1280x720"))?,
    ];

    let lets_quit = Arc::new(AtomicBool::new(false));
    // Setup the Ctrl+c handler.
    {
        let lets_quit_handler = lets_quit.clone();
        ctrlc::set_handler(move || {
            lets_quit_handler.store(true, Ordering::SeqCst);
        })
        .context("Failed to set Ctrl-C handler")?;
    }

    let service = Arc::new(BufferService::new(ServiceConfig::from_env()));
    let group = service.group_create("frames", BufferMode::Internal, BufferType::Normal);
    let released = Arc::new(Released::default());
    {
        let released = released.clone();
        service.group_set_listener(group, Some(Arc::new(move |_: GroupId| released.signal())))?;
    }

    let slots = Arc::new(SlotSet::new(
        service.clone(),
        SlotsConfig::from_env().exhaustion(ExhaustionPolicy::Retry),
    ));
    slots.setup(num_slots)?;

    let start = Instant::now();
    let display_thread = {
        let slots = slots.clone();
        let lets_quit = lets_quit.clone();
        thread::spawn(move || display(&slots, &lets_quit))
    };

    let res = decode(
        &slots,
        group,
        &released,
        sizes,
        resize_at,
        num_frames,
        &lets_quit,
    );
    if res.is_err() {
        lets_quit.store(true, Ordering::SeqCst);
    }
    let displayed = match display_thread.join() {
        Ok(displayed) => displayed?,
        Err(_) => bail!("display thread panicked"),
    };
    res?;

    let elapsed = start.elapsed();
    println!(
        "{} frames decoded, {} displayed in {:.2}s ({:.1} fps)",
        slots.decode_count(),
        displayed,
        elapsed.as_secs_f64(),
        displayed as f64 / elapsed.as_secs_f64()
    );
    println!(
        "Group {}: {} buffers, {} bytes",
        group,
        service.group_count(group)?,
        service.group_usage(group)?
    );

    Ok(())
}
