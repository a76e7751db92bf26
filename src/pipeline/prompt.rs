//! Grounded instruction template for answer generation.

use crate::generation::{ContentBlock, Message, ModelPayload};
use crate::pipeline::format::PromptDocument;
use serde::Serialize;
use serde_json::ser::{Formatter, Serializer};
use std::io;

/// Generation cap; answers longer than this are truncated, not retried.
pub const MAX_TOKENS: u32 = 1000;

/// Instruction text preceding the serialized grounding documents.
pub const MESSAGE_HEADER: &str = "
あなたは社内ユーザーからの質問を応えるAIアシスタントです。
以下の手順で社員の質問に答えてください。手順以外のことは絶対にしないでください。

<回答手順>
* <参考ドキュメント></参考ドキュメント>に回答の参考となるドキュメントを設定しているので、それを全て理解してください。
    なお、この<参考ドキュメント></参考ドキュメント>は<参考ドキュメントのJSON形式></参考ドキュメントのJSON形式>のフォーマットで設定されています。ドキュメントが複数個存在する可能性があります。そのすべてを理解してください。
* <回答のルール></回答のルール>を理解してください。このルールは絶対に守ってください。ルール以外のことは一切してはいけません。例外は一切ありません。
* チャットでユーザから質問が入力されるので、あなたは<参考ドキュメント></参考ドキュメント>の内容をもとに<回答のルール></回答のルール>に従って回答を行なってください。
</回答手順>

<参考ドキュメントのJSON形式>
{
\"SourceId\": データソースのID,
\"DocumentId\": \"ドキュメントを一意に特定するIDです。\",
\"DocumentTitle\": \"ドキュメントのタイトルです。\",
\"DocumentPage\": \"ドキュメントのページです。\",
\"Content\": \"ドキュメントの内容です。こちらをもとに回答してください。\",
}
</参考ドキュメントのJSON形式>

<参考ドキュメント>
";

/// Answer rules following the serialized grounding documents.
pub const MESSAGE_FOOTER: &str = "
</参考ドキュメント>

<回答のルール>
* 雑談や挨拶には応じないでください。「私は雑談はできません。通常のチャット機能をご利用ください。」とだけ出力してください。他の文言は一切出力しないでください。例外はありません。
* 必ず<参考ドキュメント></参考ドキュメント>をもとに回答してください。<参考ドキュメント></参考ドキュメント>から読み取れないことは、絶対に回答しないでください。
* 回答の文末ごとに、参照した全てのドキュメントの SourceId を [^<SourceId>] 形式で文末に追加してください。
* <参考ドキュメント></参考ドキュメント>から読み取れない場合は、「回答に必要な情報が見つかりませんでした。」とだけ出力してください。例外はありません。
* 質問に具体性がなく回答できない場合は、質問の仕方をアドバイスしてください。
* 回答文以外の文字列は一切出力しないで下さい。回答はJSON形式ではなく、テキストで出力してください。見出しやタイトル等も必要ありません。
</回答のルール>
";

/// Wrap the grounding documents and the raw question into a model payload.
///
/// Documents are rendered with `", "` and `": "` separators and unescaped non-ASCII text,
/// the layout the instruction text was written against.
pub fn build_payload(
    documents: &[PromptDocument],
    query: &str,
    anthropic_version: &str,
) -> Result<ModelPayload, serde_json::Error> {
    let serialized = render_documents(documents)?;

    Ok(ModelPayload {
        anthropic_version: anthropic_version.to_string(),
        max_tokens: MAX_TOKENS,
        system: format!("{MESSAGE_HEADER}{serialized}{MESSAGE_FOOTER}"),
        messages: vec![Message {
            role: "user".to_string(),
            content: vec![ContentBlock::Text {
                text: query.to_string(),
            }],
        }],
    })
}

fn render_documents(documents: &[PromptDocument]) -> Result<String, serde_json::Error> {
    let mut buffer = Vec::new();
    documents.serialize(&mut Serializer::with_formatter(&mut buffer, SpacedFormatter))?;
    String::from_utf8(buffer).map_err(<serde_json::Error as serde::ser::Error>::custom)
}

struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn begin_array_value<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_key<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }
}
