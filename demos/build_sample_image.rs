use std::path::PathBuf;

use pcjit::{encode_image, ImageBuilder, OpCode};

const DEFAULT_OUT: &str = "sample.pjt";

/// Builds the sample plugin image the runner binary's README walkthrough
/// uses: `sum(n)` loops from n down to zero, reporting its progress through
/// the `print_cell` native.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_rel = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_OUT.to_string());
    let out_path = PathBuf::from(out_rel);

    let mut builder = ImageBuilder::new();
    let print_cell = builder.add_native("print_cell");

    builder.public("sum")?;
    builder.op(OpCode::Proc);
    builder.op1(OpCode::Stack, -4);
    builder.op1(OpCode::ConstPri, 0);
    builder.op1(OpCode::StorSPri, -4);
    builder.label("loop")?;
    builder.op1(OpCode::LoadSPri, 8);
    builder.jump(OpCode::Jzer, "done");
    builder.op1(OpCode::LoadSPri, 8);
    builder.op(OpCode::PushPri);
    builder.op1(OpCode::LoadSPri, -4);
    builder.op(OpCode::PopAlt);
    builder.op(OpCode::Add);
    builder.op1(OpCode::StorSPri, -4);
    builder.op1(OpCode::LoadSPri, 8);
    builder.op1(OpCode::ConstAlt, 1);
    builder.op(OpCode::Sub);
    builder.op1(OpCode::StorSPri, 8);
    builder.jump(OpCode::Jump, "loop");
    builder.label("done")?;
    builder.op1(OpCode::LoadSPri, -4);
    builder.op(OpCode::PushPri);
    builder.op1(OpCode::PushC, 4);
    builder.op1(OpCode::SysreqC, print_cell);
    builder.op1(OpCode::Stack, 8);
    builder.op(OpCode::Retn);
    builder.op(OpCode::EndProc);

    let image = builder.finish()?;
    let bytes = encode_image(&image)?;
    std::fs::write(&out_path, bytes)?;

    println!("wrote sample image to {}", out_path.display());
    println!("run it with: pcjit {} --entry sum --arg 10 --dump", out_path.display());
    Ok(())
}
