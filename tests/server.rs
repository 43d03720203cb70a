//! End-to-end: a real TCP client drives a session while a mock VM thread
//! runs through the host hook adapter.

mod common;

use common::*;
use pawndbg::debugger::DebugState;
use pawndbg::image::symbols::IDENT_VARIABLE;
use pawndbg::net::DebugServer;
use pawndbg::proto::{FrameDecoder, MessageTag, MessageWriter, PayloadReader, RawFrame};
use pawndbg::vm::{BreakInfo, ExecutionContext};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Blocking frame reader over the client socket.
struct WireClient {
    stream: TcpStream,
    decoder: FrameDecoder,
}

impl WireClient {
    fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect to debugger");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("set read timeout");
        WireClient {
            stream,
            decoder: FrameDecoder::new(),
        }
    }

    fn send(&mut self, frame: bytes::Bytes) {
        self.stream.write_all(&frame).expect("send frame");
    }

    fn recv(&mut self) -> RawFrame {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(frame) = self.decoder.next_frame().expect("well-formed frame") {
                return frame;
            }
            let read_n = self.stream.read(&mut buf).expect("read from debugger");
            assert!(read_n > 0, "server closed the connection");
            self.decoder.extend(&buf[..read_n]);
        }
    }

    fn recv_tag(&mut self, tag: MessageTag) -> RawFrame {
        loop {
            let frame = self.recv();
            if frame.tag == tag as u8 {
                return frame;
            }
        }
    }
}

fn script_image_bytes() -> Vec<u8> {
    let (names, offsets) = name_table(&["bank.sp", "credits", "deposit"]);
    let symbols = packed_symbols(&[PackedSymbol {
        addr: 0x40,
        tagid: 0,
        codestart: 0,
        codeend: 0,
        ident: IDENT_VARIABLE,
        vclass: 0,
        name: offsets[1],
        dims: vec![],
    }]);
    ImageBuilder::new()
        .section(".names", names)
        .section(".code", code_section(&[0u8; 0x100]))
        .section(".data", data_section(&[0u8; 0x80], 0x1000))
        .section(".dbg.info", dbg_info(1, 2, 1))
        .section(".dbg.files", u32_pairs(&[(0x30, offsets[0])]))
        .section(".dbg.lines", u32_pairs(&[(0x30, 9), (0x40, 10)]))
        .section(".dbg.symbols", symbols)
        .build()
}

#[test]
fn breakpoint_over_the_wire() {
    let server = DebugServer::bind("127.0.0.1:0").expect("bind test server");
    let addr = server.local_addr().unwrap();
    let hooks = server.hooks();
    let registry = server.registry();
    server.spawn();

    let image_path = write_temp_image("wire", &script_image_bytes());
    let vm = Arc::new(MockVm::new(&image_path, &["scripts/Bank.sp"], 0x200));
    vm.set_frames(vec![scripted_frame("deposit", "scripts/Bank.sp", 10)]);
    vm.poke_cell(0x40, 25000);
    let ctx: Arc<dyn ExecutionContext> = vm;

    let mut client = WireClient::connect(addr);
    client.recv_tag(MessageTag::StartDebugging);

    // With no breakpoints the hook is a pass-through.
    assert_eq!(
        hooks.dispatch_break(&ctx, BreakInfo { cip: 0x30, frm: 0 }),
        DebugState::Run
    );

    client.send(
        MessageWriter::new(MessageTag::RequestFile)
            .put_string("bank.sp")
            .finish(),
    );
    client.send(
        MessageWriter::new(MessageTag::SetBreakpoint)
            .put_string("Bank.sp")
            .put_i32(11)
            .put_i32(1)
            .finish(),
    );
    // Commands are handled in order; a request that always gets a reply
    // doubles as a barrier for the breakpoint registration.
    client.send(
        MessageWriter::new(MessageTag::RequestVariables)
            .put_string(":%local%")
            .finish(),
    );
    client.recv_tag(MessageTag::Variables);
    assert_eq!(registry.len(), 1);

    let vm_thread = {
        let hooks = hooks.clone();
        let ctx = ctx.clone();
        thread::spawn(move || hooks.dispatch_break(&ctx, BreakInfo { cip: 0x40, frm: 0 }))
    };

    let stopped = client.recv_tag(MessageTag::HasStopped);
    let mut reader = PayloadReader::new(stopped.payload);
    assert_eq!(reader.get_string().unwrap(), "Breakpoint");

    // Inspect the global while the VM thread is parked.
    client.send(
        MessageWriter::new(MessageTag::RequestEvaluate)
            .put_string("credits")
            .put_i32(0)
            .finish(),
    );
    let evaluated = client.recv_tag(MessageTag::Evaluate);
    let mut reader = PayloadReader::new(evaluated.payload);
    assert_eq!(reader.get_string().unwrap(), "credits");
    assert_eq!(reader.get_string().unwrap(), "25000");

    client.send(
        MessageWriter::new(MessageTag::Continue)
            .put_u8(DebugState::Run.to_wire() as u8)
            .finish(),
    );
    client.recv_tag(MessageTag::HasContinued);
    assert_eq!(vm_thread.join().unwrap(), DebugState::Run);

    // Disconnect tears the session down; later breaks pass through again.
    drop(client);
    wait_until(|| registry.is_empty());
    assert_eq!(
        hooks.dispatch_break(&ctx, BreakInfo { cip: 0x30, frm: 0 }),
        DebugState::Run
    );
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("condition not reached in time");
}
